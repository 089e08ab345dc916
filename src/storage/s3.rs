//! S3-compatible object stores: AWS S3, Aliyun OSS, Tencent COS, MinIO.
//!
//! All four speak the S3 REST dialect with SigV4 header auth. The flavour
//! (taken from the provider name) only picks the default endpoint:
//!
//! | Provider | Default endpoint |
//! |---|---|
//! | `s3` | `https://s3.{region}.amazonaws.com` |
//! | `oss` | `https://oss-{region}.aliyuncs.com` |
//! | `cos` | `https://cos.{region}.myqcloud.com` |
//!
//! MinIO and other self-hosted stores set `endpoint` and usually
//! `force_path_style = true`.

use super::sigv4::{self, Credentials, EMPTY_PAYLOAD_SHA256, SignRequest};
use super::{StorageError, StorageProvider, UploadOptions, encode_key, parse_options};
use crate::config::StorageConfig;
use crate::http;
use crate::retry::{self, Backoff};
use crate::types::StorageObject;
use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Empty = read `S3_ACCESS_KEY_ID`.
    #[serde(default)]
    pub access_key_id: String,
    /// Empty = read `S3_SECRET_ACCESS_KEY`.
    #[serde(default)]
    pub secret_access_key: String,
    /// Only list keys under this prefix.
    #[serde(default)]
    pub prefix: String,
    /// Public URL base, e.g. a CDN in front of the bucket.
    #[serde(default)]
    pub custom_domain: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default = "default_max_keys")]
    pub max_keys: u32,
}

fn default_max_keys() -> u32 {
    1000
}

/// Default endpoint for a flavour.
pub fn default_endpoint(flavour: &str, region: &str) -> String {
    match flavour {
        "oss" => format!("https://oss-{region}.aliyuncs.com"),
        "cos" => format!("https://cos.{region}.myqcloud.com"),
        _ => format!("https://s3.{region}.amazonaws.com"),
    }
}

#[derive(Debug, Deserialize)]
struct ListBucketResult {
    #[serde(rename = "IsTruncated", default)]
    is_truncated: bool,
    #[serde(rename = "Contents", default)]
    contents: Vec<ListedObject>,
    #[serde(rename = "NextContinuationToken", default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "LastModified")]
    last_modified: String,
    #[serde(rename = "ETag", default)]
    etag: Option<String>,
    #[serde(rename = "Size")]
    size: u64,
}

/// Parse one page of a ListObjectsV2 response.
fn parse_list_page(xml: &str) -> Result<(Vec<StorageObject>, Option<String>), StorageError> {
    let page: ListBucketResult =
        quick_xml::de::from_str(xml).map_err(|e| StorageError::Parse(e.to_string()))?;
    let mut objects = Vec::with_capacity(page.contents.len());
    for item in page.contents {
        // Zero-byte "directory" markers.
        if item.key.ends_with('/') {
            continue;
        }
        let last_modified = DateTime::parse_from_rfc3339(&item.last_modified)
            .map_err(|e| StorageError::Parse(format!("LastModified of {}: {e}", item.key)))?
            .with_timezone(&Utc);
        objects.push(StorageObject {
            key: item.key,
            size: item.size,
            last_modified,
            etag: item.etag.map(|e| e.trim_matches('"').to_string()),
        });
    }
    let next = if page.is_truncated {
        page.next_continuation_token
    } else {
        None
    };
    Ok((objects, next))
}

#[derive(Debug)]
pub struct S3Provider {
    flavour: String,
    config: S3Config,
    endpoint: Url,
    credentials: Credentials,
    client: Client,
    backoff: Backoff,
}

impl S3Provider {
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let s3: S3Config = parse_options(&config.provider, &config.options)?;
        Self::new(&config.provider, s3)
    }

    pub fn new(flavour: &str, mut config: S3Config) -> Result<Self, StorageError> {
        if config.bucket.is_empty() || config.region.is_empty() {
            return Err(StorageError::Config(format!(
                "provider '{flavour}' requires bucket and region"
            )));
        }
        if config.access_key_id.is_empty() {
            config.access_key_id = std::env::var("S3_ACCESS_KEY_ID").unwrap_or_default();
        }
        if config.secret_access_key.is_empty() {
            config.secret_access_key = std::env::var("S3_SECRET_ACCESS_KEY").unwrap_or_default();
        }
        if config.access_key_id.is_empty() || config.secret_access_key.is_empty() {
            return Err(StorageError::Config(format!(
                "provider '{flavour}' requires access_key_id and secret_access_key \
                 (or S3_ACCESS_KEY_ID / S3_SECRET_ACCESS_KEY)"
            )));
        }
        let raw_endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| default_endpoint(flavour, &config.region));
        let endpoint = Url::parse(&raw_endpoint)
            .map_err(|e| StorageError::Config(format!("endpoint '{raw_endpoint}': {e}")))?;
        if endpoint.host_str().is_none() {
            return Err(StorageError::Config(format!("endpoint '{raw_endpoint}' has no host")));
        }
        let client = http::client(http::DEFAULT_TIMEOUT)?;
        Ok(Self {
            flavour: flavour.to_string(),
            credentials: Credentials {
                access_key_id: config.access_key_id.clone(),
                secret_access_key: config.secret_access_key.clone(),
            },
            config,
            endpoint,
            client,
            backoff: Backoff::default(),
        })
    }

    fn endpoint_host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Host header and canonical URI for a key (`""` = the bucket itself).
    fn locate(&self, key: &str) -> (String, String) {
        let encoded = encode_key(key);
        if self.config.force_path_style {
            (
                self.endpoint_host(),
                format!("/{}/{encoded}", self.config.bucket),
            )
        } else {
            (
                format!("{}.{}", self.config.bucket, self.endpoint_host()),
                format!("/{encoded}"),
            )
        }
    }

    fn request_url(&self, host: &str, canonical_uri: &str, query: &[(String, String)]) -> String {
        let mut url = format!("{}://{host}{canonical_uri}", self.endpoint.scheme());
        if !query.is_empty() {
            let qs: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", super::uri_encode(k, true), super::uri_encode(v, true)))
                .collect();
            url.push('?');
            url.push_str(&qs.join("&"));
        }
        url
    }

    /// Send a signed request with retries. `headers` are signed and sent.
    fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        headers: &[(&str, String)],
        body: &[u8],
    ) -> Result<Response, StorageError> {
        let (host, canonical_uri) = self.locate(key);
        let url = self.request_url(&host, &canonical_uri, query);
        let payload_sha256 = if body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            sigv4::sha256_hex(body)
        };

        retry::retry(&self.backoff, StorageError::is_retryable, |attempt| {
            let signed = sigv4::sign(
                &SignRequest {
                    method: method.as_str(),
                    host: &host,
                    canonical_uri: &canonical_uri,
                    query,
                    headers,
                    payload_sha256: &payload_sha256,
                },
                &self.credentials,
                &self.config.region,
                "s3",
                Utc::now(),
            );
            debug!(%method, %url, attempt, "s3 request");
            let mut request = self.client.request(method.clone(), &url);
            for (name, value) in &signed {
                request = request.header(name.as_str(), value);
            }
            if !body.is_empty() {
                request = request.body(body.to_vec());
            }
            let response = request.send()?;
            let status = response.status().as_u16();
            if status == 404 || response.status().is_success() {
                Ok(response)
            } else {
                Err(StorageError::Http {
                    status,
                    url: url.clone(),
                })
            }
        })
    }

    fn list_page(&self, token: Option<&str>) -> Result<(Vec<StorageObject>, Option<String>), StorageError> {
        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("max-keys".to_string(), self.config.max_keys.to_string()),
        ];
        if !self.config.prefix.is_empty() {
            query.push(("prefix".to_string(), self.config.prefix.clone()));
        }
        if let Some(token) = token {
            query.push(("continuation-token".to_string(), token.to_string()));
        }
        let response = self.send(Method::GET, "", &query, &[], &[])?;
        if response.status().as_u16() == 404 {
            return Err(StorageError::Config(format!(
                "bucket '{}' not found",
                self.config.bucket
            )));
        }
        let xml = response.text()?;
        parse_list_page(&xml)
    }
}

impl StorageProvider for S3Provider {
    fn name(&self) -> &str {
        &self.flavour
    }

    fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let response = self.send(Method::GET, key, &[], &[], &[])?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(response.bytes()?.to_vec()))
    }

    fn list_all_files(&self) -> Result<Vec<StorageObject>, StorageError> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let (page, next) = self.list_page(token.as_deref())?;
            objects.extend(page);
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(objects)
    }

    fn generate_public_url(&self, key: &str) -> String {
        if let Some(domain) = &self.config.custom_domain {
            let base = if domain.contains("://") {
                domain.trim_end_matches('/').to_string()
            } else {
                format!("https://{}", domain.trim_end_matches('/'))
            };
            return format!("{base}/{}", encode_key(key));
        }
        let (host, canonical_uri) = self.locate(key);
        self.request_url(&host, &canonical_uri, &[])
    }

    fn upload_file(
        &self,
        key: &str,
        data: &[u8],
        opts: &UploadOptions,
    ) -> Result<StorageObject, StorageError> {
        let headers = [("content-type", opts.content_type_for(key))];
        let response = self.send(Method::PUT, key, &[], &headers, data)?;
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());
        Ok(StorageObject {
            key: key.to_string(),
            size: data.len() as u64,
            last_modified: Utc::now(),
            etag,
        })
    }

    fn delete_file(&self, key: &str) -> Result<(), StorageError> {
        self.send(Method::DELETE, key, &[], &[], &[])?;
        Ok(())
    }

    /// Server-side copy, then delete the source. Rolls back the copy if
    /// the delete fails.
    fn move_file(&self, src: &str, dst: &str) -> Result<StorageObject, StorageError> {
        let source = format!("/{}/{}", self.config.bucket, encode_key(src));
        let response = self.send(
            Method::PUT,
            dst,
            &[],
            &[("x-amz-copy-source", source)],
            &[],
        )?;
        if response.status().as_u16() == 404 {
            return Err(StorageError::NotFound(src.to_string()));
        }
        if let Err(e) = self.delete_file(src) {
            let rollback = match self.delete_file(dst) {
                Ok(()) => "destination rolled back".to_string(),
                Err(rb) => format!("rollback also failed: {rb}"),
            };
            return Err(StorageError::MoveFailed {
                src: src.to_string(),
                dst: dst.to_string(),
                reason: format!("{e}; {rollback}"),
            });
        }
        let size = self
            .send(Method::HEAD, dst, &[], &[], &[])
            .ok()
            .and_then(|r| r.content_length())
            .unwrap_or_default();
        Ok(StorageObject {
            key: dst.to_string(),
            size,
            last_modified: Utc::now(),
            etag: None,
        })
    }
}
