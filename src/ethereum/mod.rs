// Chain client adapter
//
// Deployment and method calls are exposed as blocking operations that return
// once the submitting transaction has one confirmation.

pub mod chain;
pub mod simulated;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ethers::abi::{Abi, Token};
use ethers::contract::ContractFactory;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionReceipt, TransactionRequest, H256, U256, U64};
use ethers::utils::keccak256;
use log::{debug, info};
use thiserror::Error;

use crate::artifacts::ContractArtifact;
use crate::error::ErrorCategory;

pub use simulated::{SimulatedChain, Submission};

/// Receipt of a confirmed contract creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReceipt {
    pub address: Address,
    pub transaction_hash: H256,
    pub block_number: u64,
}

/// Receipt of a confirmed method call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReceipt {
    pub transaction_hash: H256,
    pub block_number: u64,
}

/// Failures reported by a chain client. Nothing here is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("transaction reverted{}: {}", tx_suffix(.tx_hash), reason_text(.reason))]
    Reverted {
        tx_hash: Option<H256>,
        reason: Option<String>,
    },

    #[error("transaction dropped or replaced{}: {detail}", tx_suffix(.tx_hash))]
    Dropped { tx_hash: Option<H256>, detail: String },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("transaction {tx_hash:?} not confirmed after {waited:?}; it may still be included")]
    ConfirmationTimeout { tx_hash: H256, waited: Duration },

    #[error("failed to encode call: {0}")]
    Encoding(String),

    #[error("signer error: {0}")]
    Signer(String),
}

fn reason_text(reason: &Option<String>) -> &str {
    reason.as_deref().unwrap_or("no revert reason")
}

fn tx_suffix(tx_hash: &Option<H256>) -> String {
    match tx_hash {
        Some(hash) => format!(" ({:?})", hash),
        None => String::new(),
    }
}

impl ChainError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChainError::ConfirmationTimeout { .. } => ErrorCategory::ConfirmationTimeout,
            ChainError::Encoding(_) | ChainError::Signer(_) => ErrorCategory::Configuration,
            _ => ErrorCategory::Transaction,
        }
    }

    /// Map a JSON-RPC or middleware error message onto the failure taxonomy
    pub fn from_rpc_message(message: String) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("insufficient funds") {
            return ChainError::InsufficientFunds(message);
        }
        if let Some(index) = lower.find("execution reverted") {
            let reason = message[index + "execution reverted".len()..]
                .trim_start_matches(':')
                .trim();
            return ChainError::Reverted {
                tx_hash: None,
                reason: (!reason.is_empty()).then(|| reason.to_string()),
            };
        }
        if lower.contains("replacement transaction")
            || lower.contains("nonce too low")
            || lower.contains("already known")
        {
            return ChainError::Dropped {
                tx_hash: None,
                detail: message,
            };
        }
        ChainError::Unreachable(message)
    }
}

/// Capability to submit transactions and read chain state
pub trait ChainClient {
    /// Account that signs every submission
    fn sender(&self) -> Address;

    /// Deploy `artifact` with ABI-encoded constructor arguments
    fn deploy(&self, artifact: &ContractArtifact, args: &[Token]) -> Result<DeployReceipt, ChainError>;

    /// Send a state-changing call to `address`
    fn call(&self, address: Address, abi: &Abi, method: &str, args: &[Token]) -> Result<CallReceipt, ChainError>;

    /// Read one storage word
    fn storage_at(&self, address: Address, slot: H256) -> Result<H256, ChainError>;
}

impl<T: ChainClient + ?Sized> ChainClient for Box<T> {
    fn sender(&self) -> Address {
        (**self).sender()
    }

    fn deploy(&self, artifact: &ContractArtifact, args: &[Token]) -> Result<DeployReceipt, ChainError> {
        (**self).deploy(artifact, args)
    }

    fn call(&self, address: Address, abi: &Abi, method: &str, args: &[Token]) -> Result<CallReceipt, ChainError> {
        (**self).call(address, abi, method, args)
    }

    fn storage_at(&self, address: Address, slot: H256) -> Result<H256, ChainError> {
        (**self).storage_at(address, slot)
    }
}

/// EIP-1967 implementation slot: `keccak256("eip1967.proxy.implementation") - 1`
pub fn implementation_slot() -> H256 {
    let slot = U256::from_big_endian(&keccak256(b"eip1967.proxy.implementation")) - U256::one();
    let mut bytes = [0u8; 32];
    slot.to_big_endian(&mut bytes);
    H256::from(bytes)
}

/// Address stored in the low 20 bytes of a storage word
pub fn word_to_address(word: H256) -> Address {
    Address::from_slice(&word.as_bytes()[12..])
}

pub fn address_to_word(address: Address) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(address.as_bytes());
    H256::from(bytes)
}

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Interface to an Ethereum JSON-RPC node
pub struct EthereumConnector {
    client: Arc<SignerClient>,
    runtime: tokio::runtime::Runtime,
    confirmation_timeout: Duration,
    chain_id: u64,
    /// Serializes submissions so nonces are consumed in order
    submission: Mutex<()>,
}

impl EthereumConnector {
    /// Connect to `rpc_url` and sign with `private_key`
    pub fn new(rpc_url: &str, private_key: &str, confirmation_timeout: Duration) -> Result<Self, ChainError> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| ChainError::Unreachable(format!("failed to start runtime: {}", e)))?;

        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ChainError::Unreachable(format!("invalid RPC url {}: {}", rpc_url, e)))?;

        let chain_id = runtime
            .block_on(provider.get_chainid())
            .map_err(|e| ChainError::Unreachable(e.to_string()))?
            .as_u64();

        let wallet = private_key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| ChainError::Signer(e.to_string()))?
            .with_chain_id(chain_id);

        info!("Connected to chain {} as {:?}", chain_id, wallet.address());

        Ok(Self {
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
            runtime,
            confirmation_timeout,
            chain_id,
            submission: Mutex::new(()),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn submit(&self, tx: TypedTransaction) -> Result<TransactionReceipt, ChainError> {
        let _guard = self.submission.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        self.runtime.block_on(async {
            let pending = self
                .client
                .send_transaction(tx, None)
                .await
                .map_err(|e| ChainError::from_rpc_message(e.to_string()))?;
            let tx_hash: H256 = *pending;
            debug!("Submitted transaction {:?}, waiting for confirmation", tx_hash);

            match tokio::time::timeout(self.confirmation_timeout, pending).await {
                Err(_) => Err(ChainError::ConfirmationTimeout {
                    tx_hash,
                    waited: self.confirmation_timeout,
                }),
                Ok(Err(e)) => Err(ChainError::from_rpc_message(e.to_string())),
                Ok(Ok(None)) => Err(ChainError::Dropped {
                    tx_hash: Some(tx_hash),
                    detail: "transaction no longer known to the node".to_string(),
                }),
                Ok(Ok(Some(receipt))) if receipt.status == Some(U64::zero()) => Err(ChainError::Reverted {
                    tx_hash: Some(tx_hash),
                    reason: None,
                }),
                Ok(Ok(Some(receipt))) => Ok(receipt),
            }
        })
    }
}

fn block_of(receipt: &TransactionReceipt) -> u64 {
    receipt.block_number.map(|n| n.as_u64()).unwrap_or_default()
}

impl ChainClient for EthereumConnector {
    fn sender(&self) -> Address {
        self.client.address()
    }

    fn deploy(&self, artifact: &ContractArtifact, args: &[Token]) -> Result<DeployReceipt, ChainError> {
        let factory = ContractFactory::new(artifact.abi.clone(), artifact.bytecode.clone(), self.client.clone());
        let deployer = factory
            .deploy_tokens(args.to_vec())
            .map_err(|e| ChainError::Encoding(format!("{} constructor: {}", artifact.contract_name, e)))?;

        let receipt = self.submit(deployer.tx)?;
        let address = receipt.contract_address.ok_or_else(|| ChainError::Reverted {
            tx_hash: Some(receipt.transaction_hash),
            reason: Some("receipt carries no contract address".to_string()),
        })?;

        Ok(DeployReceipt {
            address,
            transaction_hash: receipt.transaction_hash,
            block_number: block_of(&receipt),
        })
    }

    fn call(&self, address: Address, abi: &Abi, method: &str, args: &[Token]) -> Result<CallReceipt, ChainError> {
        let function = abi
            .function(method)
            .map_err(|e| ChainError::Encoding(format!("{}: {}", method, e)))?;
        let data = function
            .encode_input(args)
            .map_err(|e| ChainError::Encoding(format!("{}: {}", method, e)))?;

        let tx: TypedTransaction = TransactionRequest::new().to(address).data(data).into();
        let receipt = self.submit(tx)?;

        Ok(CallReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number: block_of(&receipt),
        })
    }

    fn storage_at(&self, address: Address, slot: H256) -> Result<H256, ChainError> {
        self.runtime
            .block_on(self.client.get_storage_at(address, slot, None))
            .map_err(|e| ChainError::from_rpc_message(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_implementation_slot() {
        assert_eq!(
            implementation_slot(),
            H256::from(hex!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc"))
        );
    }

    #[test]
    fn test_word_address_conversion() {
        let address = Address::from_low_u64_be(0xbeef);
        assert_eq!(word_to_address(address_to_word(address)), address);
    }

    #[test]
    fn test_rpc_error_classification() {
        let reverted = ChainError::from_rpc_message(
            "execution reverted: Initializable: contract is already initialized".to_string(),
        );
        assert_eq!(
            reverted,
            ChainError::Reverted {
                tx_hash: None,
                reason: Some("Initializable: contract is already initialized".to_string()),
            }
        );

        assert!(matches!(
            ChainError::from_rpc_message("insufficient funds for gas * price + value".to_string()),
            ChainError::InsufficientFunds(_)
        ));
        assert!(matches!(
            ChainError::from_rpc_message("nonce too low".to_string()),
            ChainError::Dropped { tx_hash: None, .. }
        ));
        assert!(matches!(
            ChainError::from_rpc_message("error sending request: connection refused".to_string()),
            ChainError::Unreachable(_)
        ));
    }

    #[test]
    fn test_revert_reason_after_non_ascii_prefix() {
        // `İ` grows by a byte under full Unicode lowercasing
        let reverted = ChainError::from_rpc_message("İİ execution reverted: fee too high".to_string());
        assert_eq!(
            reverted,
            ChainError::Reverted {
                tx_hash: None,
                reason: Some("fee too high".to_string()),
            }
        );
    }

    #[test]
    fn test_timeout_is_its_own_category() {
        let err = ChainError::ConfirmationTimeout {
            tx_hash: H256::zero(),
            waited: Duration::from_secs(120),
        };
        assert_eq!(err.category(), ErrorCategory::ConfirmationTimeout);
        assert_eq!(
            ChainError::InsufficientFunds(String::new()).category(),
            ErrorCategory::Transaction
        );
    }
}
