// Upgrade controller
//
// Swaps the implementation behind a recorded proxy. All preconditions are
// checked against the ProxyRecord before the first submission; the record is
// only updated once the proxy's EIP-1967 slot shows the new implementation.

use common::ProxyRecord;
use ethers::abi::{parse_abi, Abi, ParamType, Token};
use ethers::types::Address;
use log::{info, warn};

use crate::artifacts::ContractArtifact;
use crate::error::{ConfigError, UpgradeError};
use crate::ethereum::{implementation_slot, word_to_address, ChainClient};

/// Upgrade function used by UUPS and transparent proxies alike
pub const DEFAULT_UPGRADE_FUNCTION: &str = "upgradeTo(address)";

/// One requested implementation swap
#[derive(Debug, Clone, Copy)]
pub struct UpgradeRequest<'a> {
    pub proxy_address: Address,
    pub new_implementation: &'a ContractArtifact,
    pub requested_by: Address,
}

pub struct UpgradeController<'a> {
    client: &'a dyn ChainClient,
    upgrade_abi: Abi,
    upgrade_method: String,
}

impl<'a> UpgradeController<'a> {
    /// `upgrade_function` is a signature such as `upgradeTo(address)`; it must
    /// take exactly one address
    pub fn new(client: &'a dyn ChainClient, upgrade_function: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidUpgradeFunction {
            signature: upgrade_function.to_string(),
            message,
        };

        let signature = upgrade_function.trim();
        let signature = signature.strip_prefix("function ").unwrap_or(signature);
        let upgrade_abi = parse_abi(&[&format!("function {}", signature)]).map_err(|e| invalid(e.to_string()))?;

        let function = upgrade_abi
            .functions()
            .next()
            .ok_or_else(|| invalid("no function declared".to_string()))?;
        let takes_address = function.inputs.len() == 1 && function.inputs[0].kind == ParamType::Address;
        if !takes_address {
            return Err(invalid("expected a single address parameter".to_string()));
        }
        let upgrade_method = function.name.clone();

        Ok(Self {
            client,
            upgrade_abi,
            upgrade_method,
        })
    }

    pub fn upgrade_method(&self) -> &str {
        &self.upgrade_method
    }

    /// Check every precondition without touching the chain.
    ///
    /// Order: authorization, storage layout, proxy state. The first failure
    /// wins.
    pub fn check(&self, record: &ProxyRecord, request: &UpgradeRequest<'_>) -> Result<(), UpgradeError> {
        if request.proxy_address != record.proxy_address {
            return Err(UpgradeError::ProxyMismatch {
                requested: request.proxy_address,
                recorded: record.proxy_address,
            });
        }

        if request.requested_by != record.admin {
            return Err(UpgradeError::Unauthorized {
                caller: request.requested_by,
                admin: record.admin,
            });
        }
        let signer = self.client.sender();
        if request.requested_by != signer {
            return Err(UpgradeError::SignerMismatch {
                caller: request.requested_by,
                signer,
            });
        }

        let computed = record.storage_layout.fingerprint();
        if computed != record.storage_layout_fingerprint {
            return Err(UpgradeError::FingerprintMismatch {
                proxy: record.proxy_address,
                recorded: record.storage_layout_fingerprint,
                computed,
            });
        }
        let contract = &request.new_implementation.contract_name;
        let next_layout = request
            .new_implementation
            .storage_layout
            .as_ref()
            .ok_or_else(|| UpgradeError::MissingStorageLayout(contract.clone()))?;
        let diff = record
            .storage_layout
            .check_upgrade(next_layout)
            .map_err(|conflict| UpgradeError::StorageLayoutConflict {
                contract: contract.clone(),
                conflict,
            })?;
        for (old, new) in &diff.renamed {
            warn!("{} renames storage variable `{}` to `{}`", contract, old, new);
        }
        if !diff.appended.is_empty() {
            info!("{} appends storage: {}", contract, diff.appended.join(", "));
        }

        if !record.is_initialized() {
            return Err(UpgradeError::ProxyNotInitialized(record.proxy_address));
        }

        Ok(())
    }

    /// Deploy the new implementation, point the proxy at it and confirm the
    /// swap from the implementation slot. Returns the updated record.
    pub fn upgrade(&self, record: &ProxyRecord, request: UpgradeRequest<'_>) -> Result<ProxyRecord, UpgradeError> {
        self.check(record, &request)?;
        let artifact = request.new_implementation;
        let proxy = record.proxy_address;
        info!(
            "Upgrading proxy {:?} from {} ({:?}) to {}",
            proxy, record.implementation_contract, record.current_implementation, artifact.contract_name
        );

        let deployed = self.client.deploy(artifact, &[]).map_err(UpgradeError::Deploy)?;
        info!("New implementation {} at {:?}", artifact.contract_name, deployed.address);

        let receipt = self
            .client
            .call(
                proxy,
                &self.upgrade_abi,
                &self.upgrade_method,
                &[Token::Address(deployed.address)],
            )
            .map_err(UpgradeError::Transaction)?;
        info!("Upgrade transaction {:?} confirmed", receipt.transaction_hash);

        let observed = self
            .client
            .storage_at(proxy, implementation_slot())
            .map(word_to_address)
            .map_err(UpgradeError::Transaction)?;
        if observed != deployed.address {
            return Err(UpgradeError::VerificationFailed {
                proxy,
                expected: deployed.address,
                observed,
            });
        }

        // check() guarantees the layout is present
        let layout = artifact.storage_layout.clone().unwrap_or_default();
        Ok(record.upgraded(deployed.address, &artifact.contract_name, layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethereum::SimulatedChain;

    #[test]
    fn test_upgrade_function_parsing() {
        let chain = SimulatedChain::new(Address::zero());
        let controller = UpgradeController::new(&chain, DEFAULT_UPGRADE_FUNCTION).unwrap();
        assert_eq!(controller.upgrade_method(), "upgradeTo");

        let controller = UpgradeController::new(&chain, "function upgradeImplementation(address impl)").unwrap();
        assert_eq!(controller.upgrade_method(), "upgradeImplementation");
    }

    #[test]
    fn test_upgrade_function_must_take_one_address() {
        let chain = SimulatedChain::new(Address::zero());
        assert!(matches!(
            UpgradeController::new(&chain, "upgradeToAndCall(address,bytes)"),
            Err(ConfigError::InvalidUpgradeFunction { .. })
        ));
        assert!(UpgradeController::new(&chain, "not a signature").is_err());
    }
}
