//! A GitHub repository branch as a photo source.
//!
//! Listing uses the recursive git trees API (one request for the whole
//! branch); reads go through `raw.githubusercontent.com`; writes and
//! deletes use the contents API, which needs the current blob sha.
//!
//! The trees API carries no timestamps, so listed objects report the Unix
//! epoch as `last_modified` and the blob sha as `etag`. Change detection
//! for this backend relies on the etag.

use super::{StorageError, StorageProvider, UploadOptions, encode_key, parse_options};
use crate::config::StorageConfig;
use crate::http;
use crate::retry::{self, Backoff};
use crate::types::StorageObject;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const RAW_BASE: &str = "https://raw.githubusercontent.com";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Directory inside the repository holding the photos.
    #[serde(default)]
    pub path: String,
    /// Empty = read `GITHUB_TOKEN`. Public repositories can be listed
    /// without one (at a low rate limit).
    #[serde(default)]
    pub token: String,
    /// Serve originals from raw.githubusercontent.com instead of github.com.
    #[serde(default = "default_true")]
    pub use_raw_url: bool,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_branch() -> String {
    "main".into()
}

fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    "https://api.github.com".into()
}

#[derive(Debug, Deserialize)]
struct Tree {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ContentMeta {
    sha: String,
}

/// Blob entries of a tree response under `prefix`.
fn objects_from_tree(tree: Tree, prefix: &str) -> Vec<StorageObject> {
    let prefix = prefix.trim_matches('/');
    tree.tree
        .into_iter()
        .filter(|e| e.kind == "blob")
        .filter(|e| {
            prefix.is_empty()
                || e.path
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .map(|e| StorageObject {
            key: e.path,
            size: e.size.unwrap_or_default(),
            last_modified: DateTime::<Utc>::UNIX_EPOCH,
            etag: Some(e.sha),
        })
        .collect()
}

#[derive(Debug)]
pub struct GitHubProvider {
    config: GitHubConfig,
    client: Client,
    backoff: Backoff,
}

impl GitHubProvider {
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let gh: GitHubConfig = parse_options(&config.provider, &config.options)?;
        Self::new(gh)
    }

    pub fn new(mut config: GitHubConfig) -> Result<Self, StorageError> {
        if config.owner.is_empty() || config.repo.is_empty() {
            return Err(StorageError::Config("github requires owner and repo".into()));
        }
        if config.token.is_empty() {
            config.token = std::env::var("GITHUB_TOKEN").unwrap_or_default();
        }
        Ok(Self {
            config,
            client: http::client(http::DEFAULT_TIMEOUT)?,
            backoff: Backoff::default(),
        })
    }

    fn contents_url(&self, key: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            encode_key(key)
        )
    }

    fn raw_url(&self, key: &str) -> String {
        format!(
            "{RAW_BASE}/{}/{}/{}/{}",
            self.config.owner,
            self.config.repo,
            self.config.branch,
            encode_key(key)
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header("accept", "application/vnd.github+json")
            .header("x-github-api-version", "2022-11-28");
        if self.config.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.config.token)
        }
    }

    /// Send with retries; 404 is returned as a response, not an error.
    fn send<F>(&self, url: &str, build: F) -> Result<Response, StorageError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        retry::retry(&self.backoff, StorageError::is_retryable, |attempt| {
            debug!(%url, attempt, "github request");
            let response = self.authorized(build(&self.client)).send()?;
            let status = response.status().as_u16();
            if status == 404 || response.status().is_success() {
                Ok(response)
            } else {
                Err(StorageError::Http {
                    status,
                    url: url.to_string(),
                })
            }
        })
    }

    /// Current blob sha of a file, `None` if it does not exist.
    fn current_sha(&self, key: &str) -> Result<Option<String>, StorageError> {
        let url = self.contents_url(key);
        let response = self.send(&url, |c| {
            c.get(&url).query(&[("ref", self.config.branch.as_str())])
        })?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let meta: ContentMeta = response.json()?;
        Ok(Some(meta.sha))
    }
}

impl StorageProvider for GitHubProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let raw = self.raw_url(key);
        let response = if self.config.token.is_empty() {
            self.send(&raw, |c| c.get(&raw))?
        } else {
            // Private repositories: the contents API serves raw bytes too.
            let url = self.contents_url(key);
            self.send(&url, |c| {
                c.get(&url)
                    .query(&[("ref", self.config.branch.as_str())])
                    .header("accept", "application/vnd.github.raw")
            })?
        };
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(response.bytes()?.to_vec()))
    }

    fn list_all_files(&self) -> Result<Vec<StorageObject>, StorageError> {
        let url = format!(
            "{}/repos/{}/{}/git/trees/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            encode_key(&self.config.branch)
        );
        let response = self.send(&url, |c| c.get(&url).query(&[("recursive", "1")]))?;
        if response.status().as_u16() == 404 {
            return Err(StorageError::Config(format!(
                "branch '{}' of {}/{} not found",
                self.config.branch, self.config.owner, self.config.repo
            )));
        }
        let tree: Tree = response.json()?;
        if tree.truncated {
            tracing::warn!(
                repo = %self.config.repo,
                "git tree listing was truncated by GitHub; some photos may be missing"
            );
        }
        Ok(objects_from_tree(tree, &self.config.path))
    }

    fn generate_public_url(&self, key: &str) -> String {
        if self.config.use_raw_url {
            self.raw_url(key)
        } else {
            format!(
                "https://github.com/{}/{}/blob/{}/{}?raw=true",
                self.config.owner,
                self.config.repo,
                self.config.branch,
                encode_key(key)
            )
        }
    }

    fn upload_file(
        &self,
        key: &str,
        data: &[u8],
        _opts: &UploadOptions,
    ) -> Result<StorageObject, StorageError> {
        let mut body = json!({
            "message": format!("Upload {key}"),
            "content": BASE64.encode(data),
            "branch": self.config.branch,
        });
        if let Some(sha) = self.current_sha(key)? {
            body["sha"] = json!(sha);
        }
        let url = self.contents_url(key);
        let response = self.send(&url, |c| c.request(Method::PUT, &url).json(&body))?;
        let created: serde_json::Value = response.json()?;
        let sha = created["content"]["sha"].as_str().map(str::to_string);
        Ok(StorageObject {
            key: key.to_string(),
            size: data.len() as u64,
            last_modified: Utc::now(),
            etag: sha,
        })
    }

    fn delete_file(&self, key: &str) -> Result<(), StorageError> {
        let Some(sha) = self.current_sha(key)? else {
            return Ok(());
        };
        let body = json!({
            "message": format!("Delete {key}"),
            "sha": sha,
            "branch": self.config.branch,
        });
        let url = self.contents_url(key);
        self.send(&url, |c| c.request(Method::DELETE, &url).json(&body))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(path: &str, raw: bool) -> GitHubProvider {
        GitHubProvider::new(GitHubConfig {
            owner: "octo".into(),
            repo: "gallery".into(),
            branch: "main".into(),
            path: path.into(),
            token: "t".into(),
            use_raw_url: raw,
            api_url: default_api_url(),
        })
        .unwrap()
    }

    #[test]
    fn tree_listing_keeps_blobs_under_path() {
        let tree: Tree = serde_json::from_value(json!({
            "sha": "root",
            "truncated": false,
            "tree": [
                {"path": "photos", "type": "tree", "sha": "t1", "mode": "040000"},
                {"path": "photos/a.jpg", "type": "blob", "sha": "b1", "size": 10, "mode": "100644"},
                {"path": "photos-old/b.jpg", "type": "blob", "sha": "b2", "size": 20, "mode": "100644"},
                {"path": "README.md", "type": "blob", "sha": "b3", "size": 5, "mode": "100644"}
            ]
        }))
        .unwrap();
        let objects = objects_from_tree(tree, "photos/");
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "photos/a.jpg");
        assert_eq!(objects[0].etag.as_deref(), Some("b1"));
        assert_eq!(objects[0].last_modified.timestamp(), 0);
    }

    #[test]
    fn empty_path_lists_everything() {
        let tree: Tree = serde_json::from_value(json!({
            "tree": [
                {"path": "a.jpg", "type": "blob", "sha": "1", "size": 1},
                {"path": "d/b.jpg", "type": "blob", "sha": "2", "size": 1}
            ]
        }))
        .unwrap();
        assert_eq!(objects_from_tree(tree, "").len(), 2);
    }

    #[test]
    fn public_urls() {
        assert_eq!(
            provider("", true).generate_public_url("photos/a b.jpg"),
            "https://raw.githubusercontent.com/octo/gallery/main/photos/a%20b.jpg"
        );
        assert_eq!(
            provider("", false).generate_public_url("a.jpg"),
            "https://github.com/octo/gallery/blob/main/a.jpg?raw=true"
        );
    }

    #[test]
    fn contents_url_encodes_key() {
        assert_eq!(
            provider("", true).contents_url("x/ü.jpg"),
            "https://api.github.com/repos/octo/gallery/contents/x/%C3%BC.jpg"
        );
    }

    #[test]
    fn owner_and_repo_required() {
        let err = GitHubProvider::new(GitHubConfig {
            owner: String::new(),
            repo: "r".into(),
            branch: default_branch(),
            path: String::new(),
            token: String::new(),
            use_raw_url: true,
            api_url: default_api_url(),
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
