// Known chains and their block timing
//
// The registry is consulted when validating the confirmation timeout: waiting
// less than one typical block interval would turn every submission into a
// timeout.

use std::collections::HashMap;
use std::time::Duration;

/// Block time assumed for chains the registry does not know
pub const DEFAULT_BLOCK_TIME_SECS: u64 = 12;

/// Chain configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Chain ID
    pub chain_id: u64,

    /// Network name as used in configuration files
    pub network: String,

    /// Human readable chain name
    pub name: String,

    /// Average block time in seconds
    pub block_time: u64,

    /// Native currency symbol
    pub currency_symbol: String,
}

impl ChainConfig {
    /// Create a new chain configuration
    pub fn new(chain_id: u64, network: &str, name: &str, block_time: u64, currency_symbol: &str) -> Self {
        Self {
            chain_id,
            network: network.to_string(),
            name: name.to_string(),
            block_time,
            currency_symbol: currency_symbol.to_string(),
        }
    }

    pub fn ethereum() -> Self {
        Self::new(1, "mainnet", "Ethereum Mainnet", 12, "ETH")
    }

    pub fn sepolia() -> Self {
        Self::new(11155111, "sepolia", "Sepolia", 12, "ETH")
    }

    pub fn polygon() -> Self {
        Self::new(137, "polygon", "Polygon", 2, "MATIC")
    }

    pub fn arbitrum() -> Self {
        Self::new(42161, "arbitrum", "Arbitrum", 1, "ETH")
    }

    pub fn optimism() -> Self {
        Self::new(10, "optimism", "Optimism", 2, "ETH")
    }

    pub fn base() -> Self {
        Self::new(8453, "base", "Base", 2, "ETH")
    }

    /// Local hardhat / anvil node
    pub fn localhost() -> Self {
        Self::new(31337, "localhost", "Local development node", 1, "ETH")
    }

    /// Shortest confirmation timeout that makes sense on this chain
    pub fn minimum_confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.block_time)
    }
}

/// Chain registry for looking up chain configurations
pub struct ChainRegistry {
    /// Map of chain ID to chain configuration
    configs: HashMap<u64, ChainConfig>,
}

impl ChainRegistry {
    /// Create a new chain registry with default configurations
    pub fn new() -> Self {
        let mut registry = Self {
            configs: HashMap::new(),
        };

        for config in [
            ChainConfig::ethereum(),
            ChainConfig::sepolia(),
            ChainConfig::polygon(),
            ChainConfig::arbitrum(),
            ChainConfig::optimism(),
            ChainConfig::base(),
            ChainConfig::localhost(),
        ] {
            registry.add_config(config);
        }

        registry
    }

    /// Get chain configuration by chain ID
    pub fn get_config(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.configs.get(&chain_id)
    }

    /// Get chain configuration by network name (`mainnet`, `sepolia`, ...)
    pub fn find_network(&self, network: &str) -> Option<&ChainConfig> {
        let network = network.to_lowercase();
        // hardhat's in-process network shares the localhost chain id
        let network = if network == "hardhat" { "localhost".to_string() } else { network };
        self.configs.values().find(|config| config.network == network)
    }

    /// Resolve by chain id first, then by network name
    pub fn resolve(&self, chain_id: Option<u64>, network: &str) -> Option<&ChainConfig> {
        chain_id
            .and_then(|id| self.get_config(id))
            .or_else(|| self.find_network(network))
    }

    /// Block time for a chain, falling back to [`DEFAULT_BLOCK_TIME_SECS`]
    pub fn block_time(&self, chain_id: Option<u64>, network: &str) -> Duration {
        self.resolve(chain_id, network)
            .map(ChainConfig::minimum_confirmation_timeout)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_BLOCK_TIME_SECS))
    }

    /// Add or update a chain configuration
    pub fn add_config(&mut self, config: ChainConfig) {
        self.configs.insert(config.chain_id, config);
    }

    /// All known chains ordered by chain id
    pub fn chains(&self) -> Vec<&ChainConfig> {
        let mut chains: Vec<_> = self.configs.values().collect();
        chains.sort_by_key(|config| config.chain_id);
        chains
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_id_and_name() {
        let registry = ChainRegistry::new();
        assert_eq!(registry.get_config(1).unwrap().network, "mainnet");
        assert_eq!(registry.find_network("Sepolia").unwrap().chain_id, 11155111);
        assert_eq!(registry.find_network("hardhat").unwrap().chain_id, 31337);
        assert_eq!(registry.resolve(Some(137), "mainnet").unwrap().name, "Polygon");
    }

    #[test]
    fn test_unknown_chain_uses_default_block_time() {
        let registry = ChainRegistry::new();
        assert_eq!(registry.block_time(Some(999_999), "devnet"), Duration::from_secs(DEFAULT_BLOCK_TIME_SECS));
        assert_eq!(registry.block_time(None, "arbitrum"), Duration::from_secs(1));
    }
}
