//! End-to-end runs against an in-memory source.

mod common;

use common::{Workspace, jpeg, with_motion_trailer};
use photo_manifest::builder::{BuildOptions, State};
use photo_manifest::cache::ForceFlags;
use photo_manifest::storage::epoch_plus;
use photo_manifest::types::VideoSource;
use serde_json::json;

fn run(ws: &Workspace) -> photo_manifest::builder::BuildSummary {
    ws.builder().run(&BuildOptions::default()).unwrap()
}

fn run_with(ws: &Workspace, flags: ForceFlags) -> photo_manifest::builder::BuildSummary {
    ws.builder().run(&BuildOptions { flags }).unwrap()
}

#[test]
fn incremental_run_adds_keeps_and_deletes() {
    let ws = Workspace::new();
    ws.put("b.jpg", jpeg(40, 30, 10));
    ws.put("c.jpg", jpeg(40, 30, 20));
    let first = run(&ws);
    assert_eq!(first.stats.new, 2);
    assert_eq!(ws.keys(), vec!["b.jpg", "c.jpg"]);

    ws.provider.remove("c.jpg");
    let a = jpeg(30, 40, 30);
    ws.extractor.add(
        &a,
        json!({"Make": "FUJIFILM", "Model": "X-T5", "GPSLatitude": 48.8566, "GPSLongitude": 2.3522}),
    );
    ws.put("a.jpg", a);

    let second = run(&ws);
    assert_eq!(second.stats.new, 1);
    assert_eq!(second.stats.processed, 0);
    assert_eq!(second.stats.skipped, 1);
    assert_eq!(second.stats.deleted, 1);
    assert_eq!(second.stats.failed, 0);
    assert_eq!(second.deleted_keys, vec!["c.jpg".to_string()]);

    assert_eq!(ws.keys(), vec!["a.jpg", "b.jpg"]);
    let manifest = ws.manifest();
    let a_item = manifest.data.iter().find(|i| i.s3_key == "a.jpg").unwrap();
    assert_eq!((a_item.width, a_item.height), (30, 40));
    assert_eq!(a_item.exif.as_ref().unwrap().gps(), Some((48.8566, 2.3522)));
    assert_eq!(manifest.cameras.len(), 1);
    // c's thumbnail went with it.
    assert_eq!(ws.thumbnail_count(), 2);
}

#[test]
fn unchanged_source_is_idempotent() {
    let ws = Workspace::new();
    ws.put("one.jpg", jpeg(20, 20, 1));
    ws.put("two/three.jpg", jpeg(20, 20, 2));
    run(&ws);
    let saved = std::fs::read(&ws.config.output.manifest_path).unwrap();
    let calls = ws.extractor.calls();

    let again = run(&ws);
    assert_eq!(again.stats.skipped, 2);
    assert!(!again.stats.has_changes());
    assert_eq!(ws.extractor.calls(), calls);
    assert_eq!(std::fs::read(&ws.config.output.manifest_path).unwrap(), saved);
}

#[test]
fn modified_object_is_reprocessed() {
    let ws = Workspace::new();
    ws.put("a.jpg", jpeg(20, 20, 1));
    run(&ws);

    ws.provider
        .insert_at("a.jpg", jpeg(24, 20, 200), epoch_plus(2_000_000));
    let summary = run(&ws);
    assert_eq!(summary.stats.processed, 1);
    let item = &ws.manifest().data[0];
    assert_eq!(item.width, 24);
    assert_eq!(item.last_modified, epoch_plus(2_000_000));
}

#[test]
fn force_manifest_keeps_thumbnails() {
    let ws = Workspace::new();
    ws.put("a.jpg", jpeg(20, 20, 1));
    run(&ws);
    let calls = ws.extractor.calls();
    let before = ws.manifest().data[0].clone();

    let summary = run_with(
        &ws,
        ForceFlags {
            force_manifest: true,
            ..Default::default()
        },
    );
    assert_eq!(summary.stats.processed, 1);
    assert_eq!(ws.extractor.calls(), calls + 1);
    let after = &ws.manifest().data[0];
    assert_eq!(after.thumbnail_url, before.thumbnail_url);
    assert_eq!(after.thumb_hash, before.thumb_hash);
}

#[test]
fn force_thumbnails_skips_metadata() {
    let ws = Workspace::new();
    ws.put("a.jpg", jpeg(20, 20, 1));
    run(&ws);
    let calls = ws.extractor.calls();

    let summary = run_with(
        &ws,
        ForceFlags {
            force_thumbnails: true,
            ..Default::default()
        },
    );
    assert_eq!(summary.stats.processed, 1);
    assert_eq!(ws.extractor.calls(), calls);
    assert_eq!(ws.thumbnail_count(), 1);
}

#[test]
fn force_reprocesses_everything() {
    let ws = Workspace::new();
    ws.put("a.jpg", jpeg(20, 20, 1));
    ws.put("b.jpg", jpeg(20, 20, 2));
    run(&ws);

    let summary = run_with(
        &ws,
        ForceFlags {
            force: true,
            ..Default::default()
        },
    );
    assert_eq!(summary.stats.processed, 2);
    assert_eq!(summary.stats.skipped, 0);
}

#[test]
fn live_photo_pair_attaches_video() {
    let ws = Workspace::new();
    ws.put("IMG_7.jpg", jpeg(20, 20, 7));
    ws.put("IMG_7.mov", vec![0u8; 64]);
    let summary = run(&ws);
    assert_eq!(summary.total, 1);

    let item = &ws.manifest().data[0];
    assert!(matches!(
        &item.video,
        Some(VideoSource::LivePhoto { video_key, .. }) if video_key == "IMG_7.mov"
    ));
}

#[test]
fn live_and_motion_video_conflict_fails_task() {
    let ws = Workspace::new();
    let data = with_motion_trailer(&jpeg(20, 20, 9));
    ws.extractor
        .add(&data, json!({"MicroVideo": 1, "MicroVideoOffset": 10_000}));
    ws.put("IMG_9.jpg", data);
    ws.put("IMG_9.mov", vec![0u8; 64]);
    ws.put("ok.jpg", jpeg(20, 20, 3));

    let builder = ws.builder();
    let summary = builder.run(&BuildOptions::default()).unwrap();
    assert_eq!(builder.state(), State::Done);
    assert_eq!(summary.stats.failed, 1);
    assert_eq!(summary.failures[0].key, "IMG_9.jpg");
    assert_eq!(ws.keys(), vec!["ok.jpg"]);
}

#[test]
fn motion_photo_without_pair_is_detected() {
    let ws = Workspace::new();
    let data = with_motion_trailer(&jpeg(20, 20, 9));
    ws.extractor
        .add(&data, json!({"MicroVideo": 1, "MicroVideoOffset": 10_000}));
    ws.put("PXL_1.jpg", data);

    run(&ws);
    let item = &ws.manifest().data[0];
    assert!(matches!(
        item.video,
        Some(VideoSource::MotionPhoto { size: 10_000, .. })
    ));
}

#[test]
fn failed_photo_is_retried_next_run() {
    let ws = Workspace::new();
    ws.put("bad.jpg", b"definitely not a jpeg".to_vec());
    let first = run(&ws);
    assert_eq!(first.stats.failed, 1);
    assert!(ws.keys().is_empty());

    ws.put("bad.jpg", jpeg(20, 20, 4));
    let second = run(&ws);
    assert_eq!(second.stats.new, 1);
    assert_eq!(ws.keys(), vec!["bad.jpg"]);
}

#[test]
fn empty_source_writes_empty_manifest() {
    let ws = Workspace::new();
    let summary = run(&ws);
    assert_eq!(summary.total, 0);
    assert!(ws.manifest().data.is_empty());
}

#[test]
fn listener_sees_start_progress_and_completion() {
    use photo_manifest::progress::{ChannelListener, ProgressEvent};
    use std::sync::Arc;
    use std::sync::mpsc;

    let ws = Workspace::new();
    ws.put("a.jpg", jpeg(20, 20, 1));
    ws.put("b.jpg", jpeg(20, 20, 2));
    let (tx, rx) = mpsc::channel();
    let builder = ws.builder().with_listener(Arc::new(ChannelListener::new(tx)));
    builder.run(&BuildOptions::default()).unwrap();
    drop(builder);

    let events: Vec<ProgressEvent> = rx.iter().collect();
    assert!(matches!(events.first(), Some(ProgressEvent::Start { total: 2 })));
    // Worker threads may deliver snapshots out of order.
    let snapshots: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots.iter().map(|s| s.completed).max(), Some(2));
    assert_eq!(snapshots.iter().map(|s| s.new_count).max(), Some(2));
    assert!(matches!(events.last(), Some(ProgressEvent::Complete(s)) if s.item_count == 2));
}
