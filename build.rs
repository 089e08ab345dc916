use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");
    println!("cargo:rerun-if-changed=.git/index");

    // Short hash, suffixed with `-dirty` for uncommitted builds; empty
    // outside a checkout (crates.io, tarballs).
    let hash = git(&["describe", "--always", "--dirty", "--abbrev=8"]).unwrap_or_default();
    println!("cargo:rustc-env=GIT_HASH={hash}");
}
