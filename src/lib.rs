pub mod api;
pub mod artifacts;
pub mod error;
pub mod ethereum;
pub mod manifest;
pub mod pipeline;
pub mod plan;
pub mod provisioner;
pub mod upgrade;

pub use common::{DeployedArtifact, ProxyRecord, ProxyState, StorageEntry, StorageLayout};
pub use error::{ErrorCategory, OrchestratorError};
