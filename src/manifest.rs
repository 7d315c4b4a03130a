// Deployment manifest and upgrade audit log
//
// The manifest is the single source of truth for what a run put on chain. It is
// written as pretty JSON through a temporary sibling file so a crash never leaves
// a half-written manifest behind.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use common::{DeployedArtifact, ProxyRecord};
use ethers::types::Address;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, ManifestError};

/// Version written into every manifest
pub const ORCHESTRATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    /// Run stopped early; artifacts are what made it on chain
    Partial,
    Complete,
}

/// Step a partial run stopped at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub step_id: String,
    pub category: ErrorCategory,
    pub error: String,
    /// Implementation contract the failed step deployed before stopping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<DeployedArtifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub plan: String,
    pub network: NetworkInfo,
    pub deployer: Address,
    pub orchestrator_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: ManifestStatus,
    /// Successful steps in execution order
    pub artifacts: Vec<DeployedArtifact>,
    /// Proxy records keyed by the step id that provisioned them
    #[serde(default)]
    pub proxies: BTreeMap<String, ProxyRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

impl DeploymentManifest {
    /// Empty manifest for a run that is about to start
    pub fn new(plan: &str, network: NetworkInfo, deployer: Address) -> Self {
        let now = Utc::now();
        Self {
            plan: plan.to_string(),
            network,
            deployer,
            orchestrator_version: ORCHESTRATOR_VERSION.to_string(),
            created_at: now,
            updated_at: now,
            status: ManifestStatus::Partial,
            artifacts: Vec::new(),
            proxies: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn record_artifact(&mut self, artifact: DeployedArtifact) {
        self.artifacts.push(artifact);
        self.touch();
    }

    pub fn record_proxy(&mut self, step_id: &str, record: ProxyRecord) {
        self.proxies.insert(step_id.to_string(), record);
        self.touch();
    }

    pub fn mark_failed(
        &mut self,
        step_id: &str,
        category: ErrorCategory,
        error: String,
        implementation: Option<DeployedArtifact>,
    ) {
        self.status = ManifestStatus::Partial;
        self.failure = Some(FailureRecord {
            step_id: step_id.to_string(),
            category,
            error,
            implementation,
        });
        self.touch();
    }

    pub fn mark_complete(&mut self) {
        self.status = ManifestStatus::Complete;
        self.failure = None;
        self.touch();
    }

    pub fn is_complete(&self) -> bool {
        self.status == ManifestStatus::Complete
    }

    pub fn artifact(&self, step_id: &str) -> Option<&DeployedArtifact> {
        self.artifacts.iter().find(|a| a.step_id == step_id)
    }

    pub fn proxy(&self, name: &str) -> Option<&ProxyRecord> {
        self.proxies.get(name)
    }

    /// Step ids in the order they were recorded
    pub fn step_ids(&self) -> Vec<&str> {
        self.artifacts.iter().map(|a| a.step_id.as_str()).collect()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write to `path` via a temporary sibling and a rename
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ManifestError> {
        let path = path.as_ref();
        let json = self.to_json()?;
        let io_error = |source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let temp = temp_path(path);
        fs::write(&temp, json).map_err(io_error)?;
        fs::rename(&temp, path).map_err(io_error)?;

        info!("Manifest ({:?}) written to {}", self.status, path.display());
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    Upgraded { new_implementation: Address },
    Rejected { category: ErrorCategory, error: String },
}

/// One upgrade attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub proxy_name: String,
    pub proxy_address: Address,
    pub requested_by: Address,
    pub previous_implementation: Address,
    pub previous_contract: String,
    pub requested_contract: String,
    pub outcome: AuditOutcome,
}

/// Append-only JSON lines log of upgrade attempts
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<(), ManifestError> {
        let io_error = |source| ManifestError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error)?;
        file.write_all(line.as_bytes()).map_err(io_error)?;

        debug!("Audit entry for {} appended to {}", entry.proxy_name, self.path.display());
        Ok(())
    }

    /// All entries; a missing file is an empty log
    pub fn entries(&self) -> Result<Vec<AuditEntry>, ManifestError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let text = fs::read_to_string(&self.path).map_err(|source| ManifestError::Io {
            path: self.path.clone(),
            source,
        })?;

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| ManifestError::Parse {
                    path: self.path.clone(),
                    source,
                })
            })
            .collect()
    }
}
