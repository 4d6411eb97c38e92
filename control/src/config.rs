//! Configuration for the EdgeSync controller
//!
//! Everything is read from environment variables. The repository, the
//! credential and the three routing filters are required; the process
//! refuses to start without them.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Git repository holding the load balancer config
    pub repository: RepositoryConfig,

    /// Resource filters
    pub filters: FilterConfig,

    /// Watch timing
    #[serde(default)]
    pub watch: WatchConfig,

    /// Keep `acmeRoutes` in sync with the issuer annotation on update
    #[serde(default = "default_false")]
    pub prune_stale_acme: bool,
}

/// Repository and working copy settings
#[derive(Clone, Deserialize, Serialize)]
pub struct RepositoryConfig {
    /// Remote URL (without credentials)
    pub url: String,

    /// Branch to check out, commit to and push
    pub branch: String,

    /// Document path relative to the working copy root
    pub file_path: PathBuf,

    /// Credential token embedded into the remote URL
    #[serde(skip_serializing)]
    pub token: String,

    /// Local working copy location
    #[serde(default = "default_repo_dir")]
    pub workdir: PathBuf,

    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,
}

impl std::fmt::Debug for RepositoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryConfig")
            .field("url", &self.url)
            .field("branch", &self.branch)
            .field("file_path", &self.file_path)
            .field("token", &"***")
            .field("workdir", &self.workdir)
            .field("author_name", &self.author_name)
            .field("author_email", &self.author_email)
            .finish()
    }
}

/// Which resources produce routes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Accepted value of the `kubernetes.io/ingress.class` annotation
    pub ingress_class: String,

    /// Production value of the `cert-manager.io/cluster-issuer` annotation
    pub cluster_issuer: String,

    /// External-marker label on Services: `key` or `key=value`
    pub external_label: String,

    /// Annotation carrying the externally routed subdomain
    #[serde(default = "default_subdomain_annotation")]
    pub subdomain_annotation: String,

    /// Annotation carrying the ingress controller's address
    #[serde(default = "default_ip_annotation")]
    pub ip_annotation: String,
}

/// Watch stream and reconnect timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchConfig {
    /// Server-side watch timeout in seconds (default: 60s)
    #[serde(default = "default_watch_timeout")]
    pub timeout_secs: u32,

    /// Delay before reopening a failed stream (default: 10s)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Upper bound for the reconnect delay (default: 10s, i.e. fixed backoff)
    #[serde(default = "default_retry_interval")]
    pub retry_max_interval_secs: u64,
}

impl WatchConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_secs(self.retry_max_interval_secs.max(self.retry_interval_secs))
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_watch_timeout(),
            retry_interval_secs: default_retry_interval(),
            retry_max_interval_secs: default_retry_interval(),
        }
    }
}

fn default_false() -> bool {
    false
}

fn default_watch_timeout() -> u32 {
    60
}

fn default_retry_interval() -> u64 {
    10
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from("/tmp/edgesync/repo")
}

fn default_author_name() -> String {
    "edgesync".to_string()
}

fn default_author_email() -> String {
    "edgesync@localhost".to_string()
}

fn default_subdomain_annotation() -> String {
    "external-dns.alpha.kubernetes.io/hostname".to_string()
}

fn default_ip_annotation() -> String {
    "external-dns.alpha.kubernetes.io/target".to_string()
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (empty values count as unset)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| {
                SyncError::config(format!("missing required environment variable {}", key))
            })
        };

        let repository = RepositoryConfig {
            url: required("REPO")?,
            branch: required("BRANCH")?,
            file_path: PathBuf::from(required("FILEPATH")?),
            token: required("TOKEN")?,
            workdir: get("REPO_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_repo_dir),
            author_name: get("GIT_AUTHOR_NAME").unwrap_or_else(default_author_name),
            author_email: get("GIT_AUTHOR_EMAIL").unwrap_or_else(default_author_email),
        };

        if repository.file_path.is_absolute() {
            return Err(SyncError::config(format!(
                "FILEPATH must be relative to the repository root, got {}",
                repository.file_path.display()
            )));
        }

        let filters = FilterConfig {
            ingress_class: required("INGRESS_CLASS")?,
            cluster_issuer: required("CLUSTER_ISSUER")?,
            external_label: required("EXTERNAL")?,
            subdomain_annotation: get("SUBDOMAIN_ANNOTATION")
                .unwrap_or_else(default_subdomain_annotation),
            ip_annotation: get("IP_ANNOTATION").unwrap_or_else(default_ip_annotation),
        };

        let watch = WatchConfig {
            timeout_secs: parse_or(&get, "WATCH_TIMEOUT_SECS", default_watch_timeout())?,
            retry_interval_secs: parse_or(&get, "RETRY_INTERVAL_SECS", default_retry_interval())?,
            retry_max_interval_secs: parse_or(
                &get,
                "RETRY_MAX_INTERVAL_SECS",
                default_retry_interval(),
            )?,
        };

        for (key, secs) in [
            ("RETRY_INTERVAL_SECS", watch.retry_interval_secs),
            ("RETRY_MAX_INTERVAL_SECS", watch.retry_max_interval_secs),
        ] {
            if secs == 0 {
                return Err(SyncError::config(format!("{} must be at least 1", key)));
            }
        }

        Ok(Self {
            repository,
            filters,
            watch,
            prune_stale_acme: parse_or(&get, "PRUNE_STALE_ACME", default_false())?,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| SyncError::config(format!("invalid value for {}: {}", key, e))),
        None => Ok(default),
    }
}
