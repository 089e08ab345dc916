//! Reverse-geocoding providers.
//!
//! | Provider | Endpoint | Default interval |
//! |---|---|---|
//! | Mapbox | `search/geocode/v6/reverse` | 100 ms |
//! | Nominatim | `/reverse?format=jsonv2` | 1000 ms (usage policy: 1 req/s) |
//!
//! Response parsing is split from the HTTP call so it can be tested against
//! captured payloads.

use super::GeocodeError;
use crate::http;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Place names for a coordinate. Coordinates are attached by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Place {
    pub country: Option<String>,
    pub city: Option<String>,
    pub location_name: Option<String>,
}

/// A reverse-geocoding backend.
pub trait GeocodingProvider: Send + Sync {
    /// Stable name, also used for the rate-limit lock files.
    fn name(&self) -> &str;

    /// Minimum time between two calls.
    fn min_interval(&self) -> Duration;

    /// `Ok(None)` means the provider has nothing for this spot.
    fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<Place>, GeocodeError>;
}

fn get_body(client: &reqwest::blocking::Client, url: Url) -> Result<Vec<u8>, GeocodeError> {
    let response = client.get(url.clone()).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(GeocodeError::Http {
            status: status.as_u16(),
            url: redact(&url),
        });
    }
    Ok(response.bytes()?.to_vec())
}

/// URL with secrets removed, for error messages.
fn redact(url: &Url) -> String {
    let mut clean = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "access_token")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    clean.query_pairs_mut().clear().extend_pairs(pairs);
    clean.to_string()
}

// ============================================================================
// Mapbox
// ============================================================================

#[derive(Debug, Deserialize)]
struct MapboxResponse {
    #[serde(default)]
    features: Vec<MapboxFeature>,
}

#[derive(Debug, Deserialize)]
struct MapboxFeature {
    properties: MapboxProperties,
}

#[derive(Debug, Deserialize)]
struct MapboxProperties {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    full_address: Option<String>,
    #[serde(default)]
    context: MapboxContext,
}

#[derive(Debug, Default, Deserialize)]
struct MapboxContext {
    country: Option<MapboxName>,
    region: Option<MapboxName>,
    place: Option<MapboxName>,
    locality: Option<MapboxName>,
}

#[derive(Debug, Deserialize)]
struct MapboxName {
    name: String,
}

/// Parse a Mapbox v6 reverse response. The first feature is the most
/// specific match.
pub fn parse_mapbox(body: &[u8]) -> Result<Option<Place>, GeocodeError> {
    let response: MapboxResponse = serde_json::from_slice(body)?;
    let Some(feature) = response.features.into_iter().next() else {
        return Ok(None);
    };
    let props = feature.properties;
    let ctx = props.context;
    let city = ctx
        .place
        .or(ctx.locality)
        .or(ctx.region)
        .map(|n| n.name);
    Ok(Some(Place {
        country: ctx.country.map(|n| n.name),
        city,
        location_name: props.full_address.or(props.name),
    }))
}

/// Mapbox Geocoding API v6.
pub struct MapboxProvider {
    client: reqwest::blocking::Client,
    base_url: Url,
    token: String,
    language: Option<String>,
    interval: Duration,
}

impl MapboxProvider {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.mapbox.com";

    pub fn new(
        token: String,
        language: Option<String>,
        interval: Duration,
    ) -> Result<Self, GeocodeError> {
        Self::with_base_url(Self::DEFAULT_BASE_URL, token, language, interval)
    }

    pub fn with_base_url(
        base_url: &str,
        token: String,
        language: Option<String>,
        interval: Duration,
    ) -> Result<Self, GeocodeError> {
        Ok(Self {
            client: http::client(http::DEFAULT_TIMEOUT)?,
            base_url: Url::parse(base_url).map_err(|e| GeocodeError::Config(e.to_string()))?,
            token,
            language,
            interval,
        })
    }

    pub fn request_url(&self, latitude: f64, longitude: f64) -> Result<Url, GeocodeError> {
        let mut url = self
            .base_url
            .join("search/geocode/v6/reverse")
            .map_err(|e| GeocodeError::Config(e.to_string()))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("longitude", &longitude.to_string());
            q.append_pair("latitude", &latitude.to_string());
            q.append_pair("limit", "1");
            if let Some(lang) = &self.language {
                q.append_pair("language", lang);
            }
            q.append_pair("access_token", &self.token);
        }
        Ok(url)
    }
}

impl GeocodingProvider for MapboxProvider {
    fn name(&self) -> &str {
        "mapbox"
    }

    fn min_interval(&self) -> Duration {
        self.interval
    }

    fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<Place>, GeocodeError> {
        let body = get_body(&self.client, self.request_url(latitude, longitude)?)?;
        parse_mapbox(&body)
    }
}

// ============================================================================
// Nominatim
// ============================================================================

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    address: NominatimAddress,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    country: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
    county: Option<String>,
    state: Option<String>,
}

/// Parse a Nominatim `jsonv2` reverse response.
pub fn parse_nominatim(body: &[u8]) -> Result<Option<Place>, GeocodeError> {
    let response: NominatimResponse = serde_json::from_slice(body)?;
    if response.error.is_some() {
        return Ok(None);
    }
    let a = response.address;
    let city = a
        .city
        .or(a.town)
        .or(a.village)
        .or(a.municipality)
        .or(a.county)
        .or(a.state);
    let location_name = response.name.filter(|n| !n.is_empty()).or(response.display_name);
    if a.country.is_none() && city.is_none() && location_name.is_none() {
        return Ok(None);
    }
    Ok(Some(Place {
        country: a.country,
        city,
        location_name,
    }))
}

/// OpenStreetMap Nominatim, or any compatible server.
pub struct NominatimProvider {
    client: reqwest::blocking::Client,
    base_url: Url,
    language: Option<String>,
    interval: Duration,
}

impl NominatimProvider {
    pub fn new(
        base_url: &str,
        language: Option<String>,
        interval: Duration,
    ) -> Result<Self, GeocodeError> {
        Ok(Self {
            client: http::client(http::DEFAULT_TIMEOUT)?,
            base_url: Url::parse(base_url).map_err(|e| GeocodeError::Config(e.to_string()))?,
            language,
            interval,
        })
    }

    pub fn request_url(&self, latitude: f64, longitude: f64) -> Result<Url, GeocodeError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut url = base
            .join("reverse")
            .map_err(|e| GeocodeError::Config(e.to_string()))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("format", "jsonv2");
            q.append_pair("lat", &latitude.to_string());
            q.append_pair("lon", &longitude.to_string());
            q.append_pair("zoom", "14");
            if let Some(lang) = &self.language {
                q.append_pair("accept-language", lang);
            }
        }
        Ok(url)
    }
}

impl GeocodingProvider for NominatimProvider {
    fn name(&self) -> &str {
        "nominatim"
    }

    fn min_interval(&self) -> Duration {
        self.interval
    }

    fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<Place>, GeocodeError> {
        let body = get_body(&self.client, self.request_url(latitude, longitude)?)?;
        parse_nominatim(&body)
    }
}
