//! Configuration for the memgit store.
//!
//! Maps directly to `memgit.toml`. Every field has a default, so an empty
//! file is a valid configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use memgit_crypto::{CloudKms, CloudKmsSettings, EnvelopeEncryption, KeyManagementClient, LocalKms};
use serde::{Deserialize, Serialize};

use crate::error::{MemgitError, Result};

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemgitConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// SQLite settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Encryption-at-rest settings.
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Commit log settings.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Search settings.
    #[serde(default)]
    pub search: SearchConfig,
    /// Cross-reference graph settings.
    #[serde(default)]
    pub graph: GraphConfig,
    /// Task queue settings.
    #[serde(default)]
    pub tasks: TaskConfig,
    /// Session sync settings.
    #[serde(default)]
    pub sessions: SessionConfig,
}

impl MemgitConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `MemgitError::Config` if the TOML is invalid or fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| MemgitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Reject values the store cannot work with.
    ///
    /// # Errors
    /// Returns `MemgitError::Config` describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(MemgitError::Config(msg.to_string()));

        if !matches!(self.general.log_format.as_str(), "pretty" | "json") {
            return bad("general.log_format must be \"pretty\" or \"json\"");
        }
        if self.general.default_branch.trim().is_empty() {
            return bad("general.default_branch must not be empty");
        }
        if self.history.default_log_limit == 0 || self.history.max_log_limit == 0 {
            return bad("history limits must be positive");
        }
        if self.history.default_log_limit > self.history.max_log_limit {
            return bad("history.default_log_limit exceeds history.max_log_limit");
        }
        if self.search.default_limit == 0 || self.graph.default_link_limit == 0 {
            return bad("search/graph limits must be positive");
        }
        if self.sessions.default_limit == 0 {
            return bad("sessions.default_limit must be positive");
        }
        if self
            .sessions
            .project_branches
            .iter()
            .any(|(project, branch)| project.trim().is_empty() || branch.trim().is_empty())
        {
            return bad("sessions.project_branches entries must not be empty");
        }
        if !matches!(self.encryption.kms.provider.as_str(), "local" | "gcp" | "none") {
            return bad("encryption.kms.provider must be \"local\", \"gcp\" or \"none\"");
        }
        if self.encryption.enabled && self.encryption.kms.provider == "none" {
            return bad("encryption.enabled requires a kms provider");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output: "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Branch created for every tenant and used when callers name none.
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Author recorded when callers name none.
    #[serde(default = "default_author")]
    pub default_author: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            default_branch: default_branch(),
            default_author: default_author(),
        }
    }
}

/// SQLite settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Use WAL mode for concurrent readers.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// How long a writer waits for the database lock before giving up.
    #[serde(default = "default_30000")]
    pub busy_timeout_ms: u64,
    /// Enforce foreign keys.
    #[serde(default = "default_true")]
    pub foreign_keys: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            wal_mode: true,
            busy_timeout_ms: 30_000,
            foreign_keys: true,
        }
    }
}

impl PersistenceConfig {
    /// Busy timeout as a [`Duration`].
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Encryption-at-rest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Encrypt new blobs for tenants that have an active data key.
    #[serde(default)]
    pub enabled: bool,
    /// Refuse to write plaintext for tenants without an active data key.
    #[serde(default)]
    pub require_active_key: bool,
    /// How long an unwrapped data key stays cached.
    #[serde(default = "default_300")]
    pub dek_cache_ttl_seconds: u64,
    /// Key-management backend.
    #[serde(default)]
    pub kms: KmsConfig,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            require_active_key: false,
            dek_cache_ttl_seconds: 300,
            kms: KmsConfig::default(),
        }
    }
}

impl EncryptionConfig {
    /// Build the configured key-management client.
    ///
    /// # Errors
    /// Returns `MemgitError::Config` for a missing master key/token or an
    /// unknown provider.
    pub fn build_kms(&self) -> Result<Arc<dyn KeyManagementClient>> {
        let kms = &self.kms;
        match kms.provider.as_str() {
            "local" => {
                let encoded = kms.master_key_base64.as_deref().ok_or_else(|| {
                    MemgitError::Config("encryption.kms.master_key_base64 is required".into())
                })?;
                let local = LocalKms::from_base64(encoded)
                    .map_err(|e| MemgitError::Config(e.to_string()))?;
                Ok(Arc::new(local))
            }
            "gcp" => {
                let access_token = std::env::var(&kms.access_token_env).map_err(|_| {
                    MemgitError::Config(format!("{} is not set", kms.access_token_env))
                })?;
                let client = CloudKms::new(CloudKmsSettings {
                    endpoint: kms.endpoint.clone(),
                    project_id: kms.project_id.clone(),
                    location: kms.location.clone(),
                    key_ring: kms.key_ring.clone(),
                    key_name: kms.key_name.clone(),
                    access_token,
                    request_timeout: Duration::from_millis(kms.request_timeout_ms),
                    max_retries: kms.max_retries,
                })
                .map_err(|e| MemgitError::Config(e.to_string()))?;
                Ok(Arc::new(client))
            }
            other => Err(MemgitError::Config(format!(
                "no key-management backend for provider `{other}`"
            ))),
        }
    }

    /// Build the shared encryption service, or `None` when disabled.
    ///
    /// # Errors
    /// As [`Self::build_kms`].
    pub fn build_service(&self) -> Result<Option<Arc<EnvelopeEncryption>>> {
        if !self.enabled {
            return Ok(None);
        }
        let kms = self.build_kms()?;
        Ok(Some(Arc::new(EnvelopeEncryption::new(
            kms,
            Duration::from_secs(self.dek_cache_ttl_seconds),
        ))))
    }
}

/// Key-management backend configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct KmsConfig {
    /// "local", "gcp", or "none".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base64 master key for the local provider.
    #[serde(default)]
    pub master_key_base64: Option<String>,
    /// GCP project.
    #[serde(default)]
    pub project_id: String,
    /// GCP key ring location.
    #[serde(default = "default_location")]
    pub location: String,
    /// GCP key ring.
    #[serde(default)]
    pub key_ring: String,
    /// GCP crypto key.
    #[serde(default)]
    pub key_name: String,
    /// Cloud KMS API root.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the OAuth2 access token.
    #[serde(default = "default_token_env")]
    pub access_token_env: String,
    /// Per-request timeout.
    #[serde(default = "default_30000")]
    pub request_timeout_ms: u64,
    /// Retries after transient failures.
    #[serde(default = "default_2")]
    pub max_retries: u32,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            master_key_base64: None,
            project_id: String::new(),
            location: default_location(),
            key_ring: String::new(),
            key_name: String::new(),
            endpoint: default_endpoint(),
            access_token_env: default_token_env(),
            request_timeout_ms: 30_000,
            max_retries: 2,
        }
    }
}

impl std::fmt::Debug for KmsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsConfig")
            .field("provider", &self.provider)
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("key_ring", &self.key_ring)
            .field("key_name", &self.key_name)
            .field("endpoint", &self.endpoint)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Commit log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Entries returned when callers give no limit.
    #[serde(default = "default_20")]
    pub default_log_limit: usize,
    /// Upper bound on any requested limit.
    #[serde(default = "default_1000")]
    pub max_log_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_log_limit: 20,
            max_log_limit: 1000,
        }
    }
}

/// Search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results returned when callers give no limit.
    #[serde(default = "default_20")]
    pub default_limit: usize,
    /// Characters kept in a result preview.
    #[serde(default = "default_500")]
    pub preview_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            preview_chars: 500,
        }
    }
}

/// Cross-reference graph settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Links returned when callers give no limit.
    #[serde(default = "default_50")]
    pub default_link_limit: usize,
    /// Default incident-edge threshold for reflect.
    #[serde(default = "default_2_usize")]
    pub reflect_min_links: usize,
    /// Default reflect result size.
    #[serde(default = "default_20")]
    pub reflect_limit: usize,
    /// Characters kept in node previews.
    #[serde(default = "default_200")]
    pub preview_chars: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_link_limit: 50,
            reflect_min_links: 2,
            reflect_limit: 20,
            preview_chars: 200,
        }
    }
}

/// Task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Claims older than this are released with reason `timeout`.
    #[serde(default = "default_1800")]
    pub claim_timeout_seconds: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            claim_timeout_seconds: 1800,
        }
    }
}

/// Session sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions listed when callers give no limit.
    #[serde(default = "default_20")]
    pub default_limit: usize,
    /// Project name (or lowercase fragment of one) to branch. Unmatched
    /// projects go to `general.default_branch`.
    #[serde(default)]
    pub project_branches: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            project_branches: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }
fn default_branch() -> String { "command-center".to_string() }
fn default_author() -> String { "claude".to_string() }
fn default_provider() -> String { "none".to_string() }
fn default_location() -> String { "global".to_string() }
fn default_endpoint() -> String { "https://cloudkms.googleapis.com".to_string() }
fn default_token_env() -> String { "GOOGLE_OAUTH_ACCESS_TOKEN".to_string() }
fn default_2() -> u32 { 2 }
fn default_2_usize() -> usize { 2 }
fn default_20() -> usize { 20 }
fn default_50() -> usize { 50 }
fn default_200() -> usize { 200 }
fn default_300() -> u64 { 300 }
fn default_500() -> usize { 500 }
fn default_1000() -> usize { 1000 }
fn default_1800() -> u64 { 1800 }
fn default_30000() -> u64 { 30_000 }
