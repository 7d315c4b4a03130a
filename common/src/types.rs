use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};

use crate::layout::StorageLayout;

/// On-chain result of one successful deployment step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedArtifact {
    /// Plan step that produced this artifact
    pub step_id: String,
    /// Artifact (contract) name that was deployed
    pub contract: String,
    /// Deployed address; for proxy steps this is the proxy
    pub address: Address,
    /// Transaction that created the contract
    pub transaction_hash: H256,
    /// Block the transaction was included in
    pub block_number: u64,
    /// Implementation behind the proxy, for proxy steps only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Address>,
}

/// Lifecycle of a proxy.
///
/// `Uninitialized -> Initialized`, then `Initialized` on every upgrade. There is
/// no way back to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Uninitialized,
    Initialized,
}

/// Everything needed to upgrade a deployed proxy safely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub proxy_address: Address,
    pub current_implementation: Address,
    /// Artifact name of the live implementation
    pub implementation_contract: String,
    /// Account allowed to rotate the implementation
    pub admin: Address,
    pub state: ProxyState,
    pub storage_layout_fingerprint: H256,
    pub storage_layout: StorageLayout,
}

impl ProxyRecord {
    /// Record for a freshly deployed, not yet initialized proxy
    pub fn new(
        proxy_address: Address,
        current_implementation: Address,
        implementation_contract: &str,
        admin: Address,
        storage_layout: StorageLayout,
    ) -> Self {
        Self {
            proxy_address,
            current_implementation,
            implementation_contract: implementation_contract.to_string(),
            admin,
            state: ProxyState::Uninitialized,
            storage_layout_fingerprint: storage_layout.fingerprint(),
            storage_layout,
        }
    }

    pub fn initialized(mut self) -> Self {
        self.state = ProxyState::Initialized;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.state == ProxyState::Initialized
    }

    /// True when the stored fingerprint still matches the stored layout
    pub fn fingerprint_matches(&self) -> bool {
        self.storage_layout.fingerprint() == self.storage_layout_fingerprint
    }

    /// Record after a confirmed implementation swap
    pub fn upgraded(&self, implementation: Address, contract: &str, layout: StorageLayout) -> Self {
        Self {
            proxy_address: self.proxy_address,
            current_implementation: implementation,
            implementation_contract: contract.to_string(),
            admin: self.admin,
            state: self.state,
            storage_layout_fingerprint: layout.fingerprint(),
            storage_layout: layout,
        }
    }
}
