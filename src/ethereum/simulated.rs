// In-memory chain
//
// Used for dry runs and tests. Addresses follow the CREATE rule for the
// simulated sender, every submission lands in its own block, and proxies are
// emulated by keeping the EIP-1967 implementation slot up to date.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use ethers::abi::{Abi, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::{get_contract_address, keccak256};
use log::debug;

use super::{
    address_to_word, implementation_slot, CallReceipt, ChainClient, ChainError, DeployReceipt,
};
use crate::artifacts::ContractArtifact;

/// One transaction the simulated chain was asked to submit
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Deploy { contract: String, args: Vec<Token> },
    Call { to: Address, method: String, args: Vec<Token> },
}

#[derive(Default)]
struct SimState {
    nonce: u64,
    block_number: u64,
    contracts: HashMap<Address, String>,
    storage: HashMap<(Address, H256), H256>,
    deploy_failures: HashMap<String, ChainError>,
    call_failures: HashMap<String, ChainError>,
    ignore_upgrades: bool,
    submissions: Vec<Submission>,
}

/// Deterministic in-memory [`ChainClient`]
pub struct SimulatedChain {
    sender: Address,
    proxy_contract: String,
    upgrade_method: String,
    state: Mutex<SimState>,
}

impl SimulatedChain {
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            proxy_contract: "ERC1967Proxy".to_string(),
            upgrade_method: "upgradeTo".to_string(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Artifact name treated as an EIP-1967 proxy `(address logic, bytes data)`
    pub fn with_proxy_contract(mut self, name: &str) -> Self {
        self.proxy_contract = name.to_string();
        self
    }

    /// Method that rotates the implementation behind a proxy
    pub fn with_upgrade_method(mut self, method: &str) -> Self {
        self.upgrade_method = method.to_string();
        self
    }

    /// Make every deployment of `contract` fail with `error`
    pub fn fail_deploy(&self, contract: &str, error: ChainError) {
        self.state().deploy_failures.insert(contract.to_string(), error);
    }

    /// Make every call of `method` fail with `error`
    pub fn fail_call(&self, method: &str, error: ChainError) {
        self.state().call_failures.insert(method.to_string(), error);
    }

    /// Accept upgrade calls without moving the implementation slot
    pub fn ignore_upgrades(&self) {
        self.state().ignore_upgrades = true;
    }

    /// Every submission attempted so far, failed ones included
    pub fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    pub fn deploy_count(&self) -> usize {
        self.state()
            .submissions
            .iter()
            .filter(|s| matches!(s, Submission::Deploy { .. }))
            .count()
    }

    /// Contract name deployed at `address`
    pub fn contract_at(&self, address: Address) -> Option<String> {
        self.state().contracts.get(&address).cloned()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_transaction(&self, state: &mut SimState) -> (H256, u64) {
        let mut preimage = self.sender.as_bytes().to_vec();
        preimage.extend_from_slice(&state.nonce.to_be_bytes());
        let tx_hash = H256::from(keccak256(preimage));
        state.nonce += 1;
        state.block_number += 1;
        (tx_hash, state.block_number)
    }
}

impl ChainClient for SimulatedChain {
    fn sender(&self) -> Address {
        self.sender
    }

    fn deploy(&self, artifact: &ContractArtifact, args: &[Token]) -> Result<DeployReceipt, ChainError> {
        let mut state = self.state();
        state.submissions.push(Submission::Deploy {
            contract: artifact.contract_name.clone(),
            args: args.to_vec(),
        });

        if let Some(error) = state.deploy_failures.get(&artifact.contract_name) {
            return Err(error.clone());
        }

        match artifact.abi.constructor() {
            Some(constructor) => {
                constructor
                    .encode_input(artifact.bytecode.to_vec(), args)
                    .map_err(|e| ChainError::Encoding(format!("{} constructor: {}", artifact.contract_name, e)))?;
            }
            None if !args.is_empty() => {
                return Err(ChainError::Encoding(format!(
                    "{} has no constructor but {} arguments were given",
                    artifact.contract_name,
                    args.len()
                )));
            }
            None => {}
        }

        let address = get_contract_address(self.sender, U256::from(state.nonce));
        let (transaction_hash, block_number) = self.next_transaction(&mut state);
        state.contracts.insert(address, artifact.contract_name.clone());

        if artifact.contract_name == self.proxy_contract {
            if let Some(Token::Address(implementation)) = args.first() {
                state
                    .storage
                    .insert((address, implementation_slot()), address_to_word(*implementation));
            }
        }

        debug!("Simulated deployment of {} at {:?}", artifact.contract_name, address);
        Ok(DeployReceipt {
            address,
            transaction_hash,
            block_number,
        })
    }

    fn call(&self, address: Address, abi: &Abi, method: &str, args: &[Token]) -> Result<CallReceipt, ChainError> {
        let mut state = self.state();
        state.submissions.push(Submission::Call {
            to: address,
            method: method.to_string(),
            args: args.to_vec(),
        });

        if let Some(error) = state.call_failures.get(method) {
            return Err(error.clone());
        }

        abi.function(method)
            .and_then(|function| function.encode_input(args))
            .map_err(|e| ChainError::Encoding(format!("{}: {}", method, e)))?;

        if !state.contracts.contains_key(&address) {
            return Err(ChainError::Reverted {
                tx_hash: None,
                reason: Some(format!("no contract at {:?}", address)),
            });
        }

        let (transaction_hash, block_number) = self.next_transaction(&mut state);

        let is_proxy = state.storage.contains_key(&(address, implementation_slot()));
        if method == self.upgrade_method && is_proxy && !state.ignore_upgrades {
            if let Some(Token::Address(implementation)) = args.first() {
                state
                    .storage
                    .insert((address, implementation_slot()), address_to_word(*implementation));
            }
        }

        Ok(CallReceipt {
            transaction_hash,
            block_number,
        })
    }

    fn storage_at(&self, address: Address, slot: H256) -> Result<H256, ChainError> {
        Ok(self
            .state()
            .storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ContractArtifact;
    use crate::ethereum::word_to_address;

    fn sender() -> Address {
        Address::from_low_u64_be(0xdead)
    }

    #[test]
    fn test_addresses_follow_create_rule() {
        let chain = SimulatedChain::new(sender());
        let token = ContractArtifact::from_human_readable("Token", &[]).unwrap();

        let first = chain.deploy(&token, &[]).unwrap();
        let second = chain.deploy(&token, &[]).unwrap();

        assert_eq!(first.address, get_contract_address(sender(), U256::zero()));
        assert_eq!(second.address, get_contract_address(sender(), U256::one()));
        assert!(second.block_number > first.block_number);
        assert_ne!(first.transaction_hash, second.transaction_hash);
    }

    #[test]
    fn test_constructor_arguments_are_type_checked() {
        let chain = SimulatedChain::new(sender());
        let curve = ContractArtifact::from_human_readable(
            "BancorBondingCurve",
            &["constructor(uint256 reserveRatio, uint256 initialPrice)"],
        )
        .unwrap();

        let err = chain.deploy(&curve, &[Token::Bool(true)]).unwrap_err();
        assert!(matches!(err, ChainError::Encoding(_)));
    }

    #[test]
    fn test_proxy_slot_tracks_upgrades() {
        let chain = SimulatedChain::new(sender());
        let implementation = ContractArtifact::from_human_readable(
            "TokenFactoryUpgradeable",
            &["function upgradeTo(address newImplementation)"],
        )
        .unwrap();
        let proxy = ContractArtifact::from_human_readable("ERC1967Proxy", &["constructor(address logic, bytes data)"]).unwrap();

        let v1 = chain.deploy(&implementation, &[]).unwrap().address;
        let deployed = chain
            .deploy(&proxy, &[Token::Address(v1), Token::Bytes(Vec::new())])
            .unwrap();
        let slot = chain.storage_at(deployed.address, implementation_slot()).unwrap();
        assert_eq!(word_to_address(slot), v1);

        let v2 = chain.deploy(&implementation, &[]).unwrap().address;
        chain
            .call(deployed.address, &implementation.abi, "upgradeTo", &[Token::Address(v2)])
            .unwrap();
        let slot = chain.storage_at(deployed.address, implementation_slot()).unwrap();
        assert_eq!(word_to_address(slot), v2);
    }

    #[test]
    fn test_custom_upgrade_method() {
        let chain = SimulatedChain::new(sender())
            .with_proxy_contract("UUPSProxy")
            .with_upgrade_method("upgradeImplementation");
        let implementation = ContractArtifact::from_human_readable(
            "Vault",
            &["function upgradeImplementation(address next)", "function upgradeTo(address next)"],
        )
        .unwrap();
        let proxy = ContractArtifact::from_human_readable("UUPSProxy", &["constructor(address logic, bytes data)"]).unwrap();

        let v1 = chain.deploy(&implementation, &[]).unwrap().address;
        let proxy_address = chain
            .deploy(&proxy, &[Token::Address(v1), Token::Bytes(Vec::new())])
            .unwrap()
            .address;
        let v2 = chain.deploy(&implementation, &[]).unwrap().address;

        chain
            .call(proxy_address, &implementation.abi, "upgradeTo", &[Token::Address(v2)])
            .unwrap();
        assert_eq!(word_to_address(chain.storage_at(proxy_address, implementation_slot()).unwrap()), v1);

        chain
            .call(proxy_address, &implementation.abi, "upgradeImplementation", &[Token::Address(v2)])
            .unwrap();
        assert_eq!(word_to_address(chain.storage_at(proxy_address, implementation_slot()).unwrap()), v2);
    }

    #[test]
    fn test_injected_failures_are_recorded() {
        let chain = SimulatedChain::new(sender());
        let token = ContractArtifact::from_human_readable("Token", &[]).unwrap();
        chain.fail_deploy(
            "Token",
            ChainError::Reverted {
                tx_hash: None,
                reason: Some("out of gas".to_string()),
            },
        );

        assert!(chain.deploy(&token, &[]).is_err());
        assert_eq!(chain.deploy_count(), 1);
        assert!(chain.contract_at(get_contract_address(sender(), U256::zero())).is_none());
    }
}
