//! Reverse geocoding of photo GPS positions.
//!
//! ```text
//! (lat, lng) ─► round to `precision` ─► cache hit? ─► LocationInfo
//!                                          │ miss
//!                                          ▼
//!                         per-key in-flight lock (one call per key)
//!                                          ▼
//!                 RateLimiter (in-process queue + lock-file protocol)
//!                                          ▼
//!                provider.reverse() with retry + backoff + jitter
//!                                          ▼
//!                    cache Some(place) / None (also on exhaustion)
//! ```
//!
//! The cache lives for one run. A `None` entry is a confirmed miss or an
//! exhausted retry budget; either way that spot is not asked again this run.
//! Lookup failures never fail a photo: the location is left unset (or cleared
//! when `force_refresh` is on) and a warning is logged.

mod providers;
pub mod rate_limit;

pub use providers::{
    GeocodingProvider, MapboxProvider, NominatimProvider, Place, parse_mapbox, parse_nominatim,
};
pub use rate_limit::{FileLock, RateLimiter};

use crate::config::{GeocodingConfig, GeocodingProviderKind};
use crate::http;
use crate::retry::{Backoff, retry};
use crate::types::{LocationInfo, ManifestItem};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unreadable response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("geocoding configuration: {0}")]
    Config(String),
}

impl GeocodeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => http::is_retryable_status(*status),
            Self::Transport(_) => true,
            Self::Parse(_) | Self::Config(_) => false,
        }
    }
}

/// Cache key for a coordinate: both axes with `precision` decimals.
///
/// ```
/// # use photo_manifest::geocoding::cache_key;
/// assert_eq!(cache_key(48.858844, 2.294381, 4), "48.8588,2.2944");
/// ```
pub fn cache_key(latitude: f64, longitude: f64, precision: u32) -> String {
    let p = precision as usize;
    format!("{latitude:.p$},{longitude:.p$}")
}

/// Build the configured provider. `auto` picks Mapbox when a token is
/// available and Nominatim otherwise.
pub fn provider_from_config(
    config: &GeocodingConfig,
) -> Result<Arc<dyn GeocodingProvider>, GeocodeError> {
    let token = config.resolved_mapbox_token();
    let kind = match (config.provider, &token) {
        (GeocodingProviderKind::Auto, Some(_)) => GeocodingProviderKind::Mapbox,
        (GeocodingProviderKind::Auto, None) => GeocodingProviderKind::Nominatim,
        (kind, _) => kind,
    };
    Ok(match kind {
        GeocodingProviderKind::Mapbox => {
            let token = token.ok_or_else(|| {
                GeocodeError::Config("mapbox provider needs a token (MAPBOX_TOKEN)".into())
            })?;
            Arc::new(MapboxProvider::new(
                token,
                config.language.clone(),
                Duration::from_millis(config.mapbox_interval_ms),
            )?)
        }
        _ => Arc::new(NominatimProvider::new(
            &config.nominatim_base_url,
            config.language.clone(),
            Duration::from_millis(config.nominatim_interval_ms),
        )?),
    })
}

type Slot = Arc<Mutex<()>>;

/// Rounded-coordinate cache in front of a rate-limited provider.
pub struct Geocoder {
    provider: Arc<dyn GeocodingProvider>,
    limiter: RateLimiter,
    backoff: Backoff,
    precision: u32,
    force_refresh: bool,
    cache: Mutex<HashMap<String, Option<Place>>>,
    in_flight: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for Geocoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geocoder")
            .field("provider", &self.provider.name())
            .field("precision", &self.precision)
            .finish_non_exhaustive()
    }
}

impl Geocoder {
    pub fn new(provider: Arc<dyn GeocodingProvider>, limiter: RateLimiter) -> Self {
        Self {
            provider,
            limiter,
            backoff: Backoff::default(),
            precision: 4,
            force_refresh: false,
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Provider, shared rate limiting and cache settings from config.
    /// Sweeps stale lock files out of the lock directory first.
    pub fn from_config(config: &GeocodingConfig) -> Result<Self, GeocodeError> {
        let provider = provider_from_config(config)?;
        Ok(Self::with_provider(config, provider))
    }

    /// Like [`Geocoder::from_config`] with an explicit provider.
    pub fn with_provider(config: &GeocodingConfig, provider: Arc<dyn GeocodingProvider>) -> Self {
        let lock_dir = config.resolved_lock_dir();
        let stale = Duration::from_millis(config.lock_stale_ms);
        let swept = rate_limit::sweep_stale(&lock_dir, stale);
        if swept > 0 {
            tracing::info!(swept, dir = %lock_dir.display(), "removed stale geocoding locks");
        }
        let lock = FileLock::new(lock_dir, provider.name(), stale);
        let limiter = RateLimiter::shared(provider.min_interval(), lock);
        Self::new(provider, limiter)
            .with_precision(config.precision)
            .with_backoff(Backoff::default().with_max_retries(config.max_retries))
            .with_force_refresh(config.force_refresh)
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Number of distinct keys resolved so far.
    pub fn cached_keys(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cached(&self, key: &str) -> Option<Option<Place>> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn slot(&self, key: &str) -> Slot {
        match self.in_flight.lock() {
            Ok(mut slots) => Arc::clone(slots.entry(key.to_string()).or_default()),
            Err(_) => Arc::new(Mutex::new(())),
        }
    }

    /// Drop the slot once the key is cached; later callers hit the cache.
    fn release(&self, key: &str) {
        if let Ok(mut slots) = self.in_flight.lock() {
            slots.remove(key);
        }
    }

    fn fetch(&self, key: &str, latitude: f64, longitude: f64) -> Option<Place> {
        let result = retry(&self.backoff, GeocodeError::is_retryable, |_| {
            self.limiter.acquire();
            self.provider.reverse(latitude, longitude)
        });
        match result {
            Ok(place) => place,
            Err(e) => {
                tracing::warn!(key, provider = self.provider.name(), error = %e, "reverse geocoding failed");
                None
            }
        }
    }

    /// Place for a coordinate, from cache or the provider.
    pub fn lookup(&self, latitude: f64, longitude: f64) -> Option<LocationInfo> {
        let key = cache_key(latitude, longitude, self.precision);
        let place = match self.cached(&key) {
            Some(hit) => hit,
            None => {
                let slot = self.slot(&key);
                let _turn = slot.lock();
                let place = match self.cached(&key) {
                    Some(hit) => hit,
                    None => {
                        let place = self.fetch(&key, latitude, longitude);
                        if let Ok(mut cache) = self.cache.lock() {
                            cache.insert(key.clone(), place.clone());
                        }
                        place
                    }
                };
                self.release(&key);
                place
            }
        }?;
        Some(LocationInfo {
            latitude,
            longitude,
            country: place.country,
            city: place.city,
            location_name: place.location_name,
        })
    }

    /// Set `item.location` from its GPS position.
    ///
    /// Items without GPS are left alone. A failed lookup keeps the previous
    /// location unless `force_refresh` is set, in which case it is cleared.
    pub fn enrich(&self, item: &mut ManifestItem) {
        let Some((lat, lng)) = item.exif.as_ref().and_then(|e| e.gps()) else {
            return;
        };
        if !self.force_refresh
            && let Some(existing) = &item.location
            && cache_key(existing.latitude, existing.longitude, self.precision)
                == cache_key(lat, lng, self.precision)
        {
            return;
        }
        match self.lookup(lat, lng) {
            Some(location) => item.location = Some(location),
            None if self.force_refresh => item.location = None,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::CountingGeocoder;
    use crate::types::PickedExif;

    fn geocoder(provider: Arc<CountingGeocoder>) -> Geocoder {
        Geocoder::new(provider, RateLimiter::new(Duration::ZERO)).with_backoff(Backoff::immediate(3))
    }

    #[test]
    fn cache_key_rounds_to_precision() {
        assert_eq!(cache_key(1.23456, -7.65432, 2), "1.23,-7.65");
        assert_eq!(cache_key(0.0, 0.0, 0), "0,0");
    }

    #[test]
    fn nearby_coordinates_share_one_call() {
        let provider = Arc::new(CountingGeocoder::found("Paris"));
        let geo = geocoder(Arc::clone(&provider));

        let a = geo.lookup(48.858_81, 2.294_48).unwrap();
        let b = geo.lookup(48.858_84, 2.294_52).unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(a.city.as_deref(), Some("Paris"));
        assert_eq!(b.latitude, 48.858_84);
        assert_eq!(geo.cached_keys(), 1);
    }

    #[test]
    fn distinct_keys_call_again() {
        let provider = Arc::new(CountingGeocoder::found("Paris"));
        let geo = geocoder(Arc::clone(&provider));
        geo.lookup(48.8588, 2.2944);
        geo.lookup(48.9, 2.2944);
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn concurrent_same_key_single_call() {
        let provider = Arc::new(CountingGeocoder::found("Rome").with_delay(Duration::from_millis(30)));
        let geo = Arc::new(geocoder(Arc::clone(&provider)));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let geo = Arc::clone(&geo);
                std::thread::spawn(move || geo.lookup(41.9028, 12.4964))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_some());
        }
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn slots_released_after_lookup() {
        let provider = Arc::new(CountingGeocoder::found("Rome").with_delay(Duration::from_millis(10)));
        let geo = Arc::new(geocoder(Arc::clone(&provider)));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let geo = Arc::clone(&geo);
                std::thread::spawn(move || geo.lookup(41.0 + f64::from(i % 4), 12.0))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(provider.calls(), 4);
        assert_eq!(geo.cached_keys(), 4);
        assert!(geo.in_flight.lock().unwrap().is_empty());
    }

    #[test]
    fn negative_result_is_cached() {
        let provider = Arc::new(CountingGeocoder::empty());
        let geo = geocoder(Arc::clone(&provider));
        assert!(geo.lookup(0.0, 0.0).is_none());
        assert!(geo.lookup(0.0, 0.0).is_none());
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn transient_failures_retried_then_cached_as_none() {
        let provider = Arc::new(CountingGeocoder::failing(503));
        let geo = geocoder(Arc::clone(&provider));
        assert!(geo.lookup(10.0, 10.0).is_none());
        // First attempt plus three retries.
        assert_eq!(provider.calls(), 4);
        assert!(geo.lookup(10.0, 10.0).is_none());
        assert_eq!(provider.calls(), 4);
    }

    #[test]
    fn permanent_failure_not_retried() {
        let provider = Arc::new(CountingGeocoder::failing(403));
        let geo = geocoder(Arc::clone(&provider));
        assert!(geo.lookup(10.0, 10.0).is_none());
        assert_eq!(provider.calls(), 1);
    }

    fn item_with_gps(lat: f64, lng: f64) -> ManifestItem {
        let obj = crate::test_helpers::object("a.jpg", 1);
        let mut item = crate::test_helpers::item(&obj);
        item.exif = Some(PickedExif {
            gps_latitude: Some(lat),
            gps_longitude: Some(lng),
            ..Default::default()
        });
        item
    }

    #[test]
    fn enrich_sets_location() {
        let geo = geocoder(Arc::new(CountingGeocoder::found("Lisbon")));
        let mut item = item_with_gps(38.72, -9.14);
        geo.enrich(&mut item);
        assert_eq!(item.location.unwrap().city.as_deref(), Some("Lisbon"));
    }

    #[test]
    fn enrich_without_gps_is_noop() {
        let provider = Arc::new(CountingGeocoder::found("X"));
        let geo = geocoder(Arc::clone(&provider));
        let obj = crate::test_helpers::object("a.jpg", 1);
        let mut item = crate::test_helpers::item(&obj);
        geo.enrich(&mut item);
        assert!(item.location.is_none());
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn enrich_keeps_matching_location() {
        let provider = Arc::new(CountingGeocoder::found("New"));
        let geo = geocoder(Arc::clone(&provider));
        let mut item = item_with_gps(38.72, -9.14);
        item.location = Some(LocationInfo {
            latitude: 38.72,
            longitude: -9.14,
            country: None,
            city: Some("Old".into()),
            location_name: None,
        });
        geo.enrich(&mut item);
        assert_eq!(item.location.unwrap().city.as_deref(), Some("Old"));
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn force_refresh_clears_on_miss() {
        let geo = geocoder(Arc::new(CountingGeocoder::empty())).with_force_refresh(true);
        let mut item = item_with_gps(1.0, 1.0);
        item.location = Some(LocationInfo {
            latitude: 1.0,
            longitude: 1.0,
            country: None,
            city: Some("Stale".into()),
            location_name: None,
        });
        geo.enrich(&mut item);
        assert!(item.location.is_none());
    }

    #[test]
    fn nominatim_selected_explicitly() {
        let config = GeocodingConfig {
            provider: GeocodingProviderKind::Nominatim,
            ..Default::default()
        };
        assert_eq!(provider_from_config(&config).unwrap().name(), "nominatim");
    }

    #[test]
    fn explicit_mapbox_with_token() {
        let config = GeocodingConfig {
            provider: GeocodingProviderKind::Mapbox,
            mapbox_token: Some("pk.test".into()),
            ..Default::default()
        };
        let provider = provider_from_config(&config).unwrap();
        assert_eq!(provider.name(), "mapbox");
        assert_eq!(provider.min_interval(), Duration::from_millis(100));
    }
}
