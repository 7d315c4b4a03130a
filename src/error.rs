// Error taxonomy
//
// Each component has its own error enum; `ErrorCategory` groups them by what
// the operator has to do next.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use common::{DeployedArtifact, LayoutConflict};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ethereum::ChainError;
use crate::plan::OutputField;

/// Operator-facing error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad plan or configuration, detected before any transaction
    Configuration,
    /// Revert, drop, insufficient funds or unreachable node
    Transaction,
    /// Outcome unknown; query the chain before doing anything else
    ConfirmationTimeout,
    /// Caller may not upgrade this proxy
    Authorization,
    /// New implementation would corrupt proxy storage
    StorageLayout,
    /// Proxy is not in a state that allows the operation
    ProxyState,
    /// A proxy exists on chain without a completed initializer
    PartialSideEffect,
    /// Chain state after the swap does not match the request
    Verification,
    /// Manifest or audit log could not be read or written
    Persistence,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Transaction => "transaction",
            ErrorCategory::ConfirmationTimeout => "confirmation timeout",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::StorageLayout => "storage layout",
            ErrorCategory::ProxyState => "proxy state",
            ErrorCategory::PartialSideEffect => "partial side effect",
            ErrorCategory::Verification => "verification",
            ErrorCategory::Persistence => "persistence",
        };
        f.write_str(name)
    }
}

/// Problems with a deployment plan
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("step id `{0}` is declared more than once")]
    DuplicateStep(String),

    #[error("step `{step}` references unknown step `{reference}`")]
    UnknownReference { step: String, reference: String },

    #[error("step `{step}` uses the output of `{reference}` without depending on it")]
    UndeclaredDependency { step: String, reference: String },

    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("step `{step}` reads `{field}` from `{reference}`, which does not produce it")]
    InvalidOutputField {
        step: String,
        reference: String,
        field: OutputField,
    },

    #[error("step `{step}` uses unknown artifact `{artifact}`")]
    UnknownArtifact { step: String, artifact: String },

    #[error("step `{step}`: `{contract}` has no initializer `{initializer}`")]
    UnknownInitializer {
        step: String,
        contract: String,
        initializer: String,
    },

    #[error("failed to load plan {path}: {message}")]
    Load { path: PathBuf, message: String },
}

/// Problems reading contract artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse artifact {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid ABI for {contract}: {message}")]
    Abi { contract: String, message: String },

    #[error("unknown artifact `{0}`")]
    Unknown(String),
}

/// Invalid orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("confirmation timeout {timeout:?} is shorter than the {block_time:?} block time of `{network}`")]
    TimeoutBelowBlockTime {
        timeout: Duration,
        block_time: Duration,
        network: String,
    },

    #[error("invalid upgrade function `{signature}`: {message}")]
    InvalidUpgradeFunction { signature: String, message: String },
}

/// Failures of the proxy provisioner
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("initializer argument {index} still references `{reference}`")]
    UnresolvedArgument { index: usize, reference: String },

    #[error("`{contract}` has no initializer `{initializer}`")]
    UnknownInitializer { contract: String, initializer: String },

    #[error("arguments do not match `{initializer}`: {message}")]
    InvalidInitializerArguments { initializer: String, message: String },

    #[error("proxy deployment failed: {0}")]
    Deploy(#[source] ChainError),

    #[error("proxy {proxy:?} was deployed but its initializer failed: {source}; the proxy is uninitialized")]
    InitializationFailedAfterDeploy {
        proxy: Address,
        implementation: Address,
        #[source]
        source: ChainError,
    },
}

impl ProvisionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProvisionError::UnresolvedArgument { .. }
            | ProvisionError::UnknownInitializer { .. }
            | ProvisionError::InvalidInitializerArguments { .. } => ErrorCategory::Configuration,
            ProvisionError::Deploy(source) => source.category(),
            ProvisionError::InitializationFailedAfterDeploy { .. } => ErrorCategory::PartialSideEffect,
        }
    }
}

/// Failures of a deployment run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid deployment plan: {0}")]
    Plan(#[from] PlanError),

    #[error("step `{step_id}` failed: {source}")]
    StepFailed {
        step_id: String,
        #[source]
        source: ChainError,
    },

    /// Provisioning failed after the step's implementation was deployed
    #[error("step `{step_id}`: {source}")]
    Provision {
        step_id: String,
        implementation: DeployedArtifact,
        #[source]
        source: ProvisionError,
    },

    #[error("step `{0}` is missing from the plan it was ordered from")]
    MissingStep(String),

    #[error("step `{step_id}`: `{field}` of `{reference}` is not available; execution order is broken")]
    UnresolvedReference {
        step_id: String,
        reference: String,
        field: OutputField,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl PipelineError {
    /// Step the run stopped at, if it got that far
    pub fn step_id(&self) -> Option<&str> {
        match self {
            PipelineError::StepFailed { step_id, .. }
            | PipelineError::Provision { step_id, .. }
            | PipelineError::UnresolvedReference { step_id, .. }
            | PipelineError::MissingStep(step_id) => Some(step_id),
            PipelineError::Plan(_) | PipelineError::Manifest(_) => None,
        }
    }

    /// Implementation contract the failed step left on chain
    pub fn deployed_implementation(&self) -> Option<&DeployedArtifact> {
        match self {
            PipelineError::Provision { implementation, .. } => Some(implementation),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Plan(_)
            | PipelineError::UnresolvedReference { .. }
            | PipelineError::MissingStep(_) => ErrorCategory::Configuration,
            PipelineError::StepFailed { source, .. } => source.category(),
            PipelineError::Provision { source, .. } => source.category(),
            PipelineError::Manifest(_) => ErrorCategory::Persistence,
        }
    }
}

/// Failures of an upgrade attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("no proxy named `{0}` in the manifest")]
    UnknownProxy(String),

    #[error("upgrade request targets {requested:?} but the record is for {recorded:?}")]
    ProxyMismatch { requested: Address, recorded: Address },

    #[error("{caller:?} is not allowed to upgrade; proxy admin is {admin:?}")]
    Unauthorized { caller: Address, admin: Address },

    #[error("upgrade requested by {caller:?} but transactions are signed by {signer:?}")]
    SignerMismatch { caller: Address, signer: Address },

    #[error("`{contract}` is incompatible with the live storage layout: {conflict}")]
    StorageLayoutConflict {
        contract: String,
        #[source]
        conflict: LayoutConflict,
    },

    #[error("`{0}` carries no storage layout; compatibility cannot be checked")]
    MissingStorageLayout(String),

    #[error("recorded storage layout of {proxy:?} does not match its fingerprint {recorded:?} (computed {computed:?})")]
    FingerprintMismatch {
        proxy: Address,
        recorded: H256,
        computed: H256,
    },

    #[error("proxy {0:?} is not initialized")]
    ProxyNotInitialized(Address),

    #[error("failed to deploy new implementation: {0}")]
    Deploy(#[source] ChainError),

    #[error("upgrade transaction failed: {0}")]
    Transaction(#[source] ChainError),

    #[error("proxy {proxy:?} reports implementation {observed:?}, expected {expected:?}")]
    VerificationFailed {
        proxy: Address,
        expected: Address,
        observed: Address,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl UpgradeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            UpgradeError::UnknownProxy(_) | UpgradeError::ProxyMismatch { .. } | UpgradeError::Config(_) => {
                ErrorCategory::Configuration
            }
            UpgradeError::Unauthorized { .. } | UpgradeError::SignerMismatch { .. } => ErrorCategory::Authorization,
            UpgradeError::StorageLayoutConflict { .. }
            | UpgradeError::MissingStorageLayout(_)
            | UpgradeError::FingerprintMismatch { .. } => ErrorCategory::StorageLayout,
            UpgradeError::ProxyNotInitialized(_) => ErrorCategory::ProxyState,
            UpgradeError::Deploy(source) | UpgradeError::Transaction(source) => source.category(),
            UpgradeError::VerificationFailed { .. } => ErrorCategory::Verification,
        }
    }
}

/// Manifest and audit log persistence failures
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors surfaced by the operator commands
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Plan(_) | OrchestratorError::Artifact(_) | OrchestratorError::Config(_) => {
                ErrorCategory::Configuration
            }
            OrchestratorError::Pipeline(e) => e.category(),
            OrchestratorError::Upgrade(e) => e.category(),
            OrchestratorError::Manifest(_) => ErrorCategory::Persistence,
        }
    }
}
