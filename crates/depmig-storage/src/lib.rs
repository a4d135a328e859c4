//! Partition artifact storage + CRM HTTP client for the migrator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use depmig_core::Division;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "depmig-storage";

pub const MANIFEST_FILE_NAME: &str = "partition-manifest.json";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub generated_at: DateTime<Utc>,
    pub files: Vec<PartitionManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifestEntry {
    pub division: Division,
    pub report_id: String,
    pub path: String,
    pub assets: usize,
    pub bytes: usize,
    pub sha256: String,
}

/// Output area holding the per-division, per-report asset artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `div-40-<report id>.json`. The id is percent-encoded, so distinct ids
    /// never share a file and no id can escape the root.
    pub fn partition_file_name(division: Division, report_id: &str) -> String {
        format!("{}-{}.json", division.artifact_prefix(), urlencoding::encode(report_id))
    }

    /// Whether `file_name` has the shape of a partition artifact of `division`.
    pub fn is_partition_file_name(division: Division, file_name: &str) -> bool {
        file_name
            .strip_prefix(division.artifact_prefix())
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_suffix(".json"))
            .is_some_and(|id| !id.is_empty())
    }

    /// Serialize `value` as pretty JSON and write it, replacing any previous file.
    pub async fn store_json<T: Serialize + ?Sized>(
        &self,
        file_name: &str,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing artifact {file_name}"))?;
        self.store_bytes(file_name, &bytes).await
    }

    /// Write bytes through a temp file and an atomic rename so readers never
    /// observe a half-written artifact.
    pub async fn store_bytes(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating artifact directory {}", self.root.display()))?;

        let absolute_path = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(bytes),
            file_name: file_name.to_string(),
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    /// Read a JSON artifact back; `Ok(None)` when it was never written.
    pub async fn load_json<T: DeserializeOwned>(&self, file_name: &str) -> anyhow::Result<Option<T>> {
        let path = self.root.join(file_name);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking artifact path {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    /// Names of the regular files directly under the root; empty when the
    /// root does not exist yet.
    pub async fn file_names(&self) -> anyhow::Result<Vec<String>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking artifact directory {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing artifact directory {}", self.root.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing artifact directory {}", self.root.display()))?
        {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn remove(&self, file_name: &str) -> anyhow::Result<()> {
        let path = self.root.join(file_name);
        fs::remove_file(&path)
            .await
            .with_context(|| format!("removing {}", path.display()))
    }

    pub async fn write_manifest(&self, manifest: &PartitionManifest) -> anyhow::Result<StoredArtifact> {
        self.store_json(MANIFEST_FILE_NAME, manifest).await
    }
}

#[derive(Debug, Clone)]
pub struct CrmClientConfig {
    pub base_url: String,
    pub access_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for CrmClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.hubapi.com".to_string(),
            access_token: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("crm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("crm returned http {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("crm response for {url} had no {field}")]
    MissingField { url: String, field: &'static str },
}

impl CrmError {
    /// Whether a later rerun could plausibly succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            CrmError::Request(err) => err.is_timeout() || err.is_connect(),
            CrmError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                .unwrap_or(false),
            CrmError::MissingField { .. } => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DealRecord {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DealSearchResponse {
    #[serde(default)]
    results: Vec<DealRecord>,
}

pub const DEAL_NAME_PROPERTY: &str = "dealname";

/// Blocking-per-call HTTP client for the CRM deal object API. No retries:
/// a failed call is reported to the caller as-is.
#[derive(Debug)]
pub struct CrmClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl CrmClient {
    pub fn new(config: CrmClientConfig) -> anyhow::Result<Self> {
        if config.access_token.trim().is_empty() {
            anyhow::bail!("crm access token is empty");
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
        })
    }

    pub fn deals_url(&self, suffix: &str) -> String {
        format!("{}/crm/v3/objects/deals{suffix}", self.base_url)
    }

    /// Request body for a token-containment search on the deal name.
    pub fn search_request_body(name_token: &str) -> serde_json::Value {
        serde_json::json!({
            "filterGroups": [{
                "filters": [{
                    "propertyName": DEAL_NAME_PROPERTY,
                    "operator": "CONTAINS_TOKEN",
                    "value": name_token,
                }]
            }],
            "properties": [DEAL_NAME_PROPERTY],
            "limit": 1,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response, CrmError> {
        let resp = request.bearer_auth(&self.access_token).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CrmError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        })
    }

    /// Id of the first deal whose name contains `name_token`, if any.
    pub async fn search_deal_by_name_token(&self, name_token: &str) -> Result<Option<String>, CrmError> {
        let url = self.deals_url("/search");
        let span = info_span!("crm_search", name_token);
        async {
            let resp = self
                .send(self.client.post(&url).json(&Self::search_request_body(name_token)), &url)
                .await?;
            let parsed: DealSearchResponse = resp.json().await?;
            let first = parsed.results.into_iter().find_map(|r| r.id);
            debug!(found = first.is_some(), "crm search complete");
            Ok::<_, CrmError>(first)
        }
        .instrument(span)
        .await
    }

    pub async fn create_deal(&self, properties: &BTreeMap<String, String>) -> Result<String, CrmError> {
        let url = self.deals_url("");
        let body = serde_json::json!({ "properties": properties });
        let resp = self.send(self.client.post(&url).json(&body), &url).await?;
        let created: DealRecord = resp.json().await?;
        created.id.ok_or(CrmError::MissingField { url, field: "id" })
    }

    pub async fn archive_deal(&self, deal_id: &str) -> Result<(), CrmError> {
        let url = self.deals_url(&format!("/{}", urlencoding::encode(deal_id)));
        self.send(self.client.delete(&url), &url).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn partition_file_names_follow_division_and_report() {
        assert_eq!(ArtifactStore::partition_file_name(Division::Div40, "123"), "div-40-123.json");
        assert_eq!(ArtifactStore::partition_file_name(Division::Div43, "../x"), "div-43-..%2Fx.json");
    }

    #[test]
    fn partition_file_names_keep_distinct_ids_apart() {
        let ids = ["A/1", "A_1", "A 1", "A%2F1", "a/1"];
        let names: std::collections::HashSet<String> = ids
            .iter()
            .map(|id| ArtifactStore::partition_file_name(Division::Div40, id))
            .collect();
        assert_eq!(names.len(), ids.len());
        assert!(names.iter().all(|n| !n.contains('/')));
    }

    #[test]
    fn recognizes_partition_file_names_per_division() {
        assert!(ArtifactStore::is_partition_file_name(Division::Div40, "div-40-123.json"));
        assert!(!ArtifactStore::is_partition_file_name(Division::Div43, "div-40-123.json"));
        assert!(!ArtifactStore::is_partition_file_name(Division::Div40, "div-40-.json"));
        assert!(!ArtifactStore::is_partition_file_name(Division::Div40, MANIFEST_FILE_NAME));
    }

    #[tokio::test]
    async fn lists_and_removes_artifacts() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().join("out"));
        assert!(store.file_names().await.expect("list missing root").is_empty());

        store.store_json("div-40-2.json", &vec!["b"]).await.expect("store");
        store.store_json("div-40-1.json", &vec!["a"]).await.expect("store");
        assert_eq!(
            store.file_names().await.expect("list"),
            vec!["div-40-1.json".to_string(), "div-40-2.json".to_string()]
        );

        store.remove("div-40-1.json").await.expect("remove");
        assert_eq!(store.file_names().await.expect("list"), vec!["div-40-2.json".to_string()]);
    }

    #[tokio::test]
    async fn store_overwrites_and_loads_back() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().join("output"));

        let first = store.store_json("div-40-1.json", &vec!["a", "b"]).await.expect("first store");
        let second = store.store_json("div-40-1.json", &vec!["c"]).await.expect("second store");

        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(first.absolute_path, second.absolute_path);
        let loaded: Option<Vec<String>> = store.load_json("div-40-1.json").await.expect("load");
        assert_eq!(loaded, Some(vec!["c".to_string()]));

        let missing: Option<Vec<String>> = store.load_json("div-43-1.json").await.expect("load missing");
        assert!(missing.is_none());

        let leftovers = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn search_body_uses_token_containment_on_deal_name() {
        let body = CrmClient::search_request_body("R-001");
        let filter = &body["filterGroups"][0]["filters"][0];
        assert_eq!(filter["propertyName"], "dealname");
        assert_eq!(filter["operator"], "CONTAINS_TOKEN");
        assert_eq!(filter["value"], "R-001");
    }

    #[test]
    fn client_requires_token_and_normalizes_base_url() {
        assert!(CrmClient::new(CrmClientConfig::default()).is_err());
        let client = CrmClient::new(CrmClientConfig {
            base_url: "http://crm.local/".into(),
            access_token: "secret".into(),
            ..Default::default()
        })
        .expect("client");
        assert_eq!(client.deals_url("/9"), "http://crm.local/crm/v3/objects/deals/9");
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        let status = |status: u16| CrmError::HttpStatus {
            status,
            url: "u".into(),
            body: String::new(),
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(400).is_transient());
        assert!(!CrmError::MissingField { url: "u".into(), field: "id" }.is_transient());
    }
}
