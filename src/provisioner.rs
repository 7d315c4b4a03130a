// Proxy provisioner
//
// Deploys an EIP-1967 proxy in front of an implementation and runs the
// implementation's initializer through it. The proxy is created with empty init
// data; the initializer is a separate call so a failure there can be told apart
// from a failed deployment.

use common::ProxyRecord;
use ethers::abi::Token;
use ethers::types::Address;
use log::{error, info, warn};

use crate::artifacts::ContractArtifact;
use crate::error::ProvisionError;
use crate::ethereum::{CallReceipt, ChainClient, DeployReceipt};
use crate::plan::ArgBinding;

/// Input of one provisioning operation
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    /// Implementation already deployed on chain
    pub implementation: Address,
    pub implementation_artifact: &'a ContractArtifact,
    pub initializer: &'a str,
    /// Must be fully resolved literals
    pub args: &'a [ArgBinding],
    /// Account recorded as allowed to upgrade
    pub admin: Address,
}

/// Result of a completed provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedProxy {
    pub record: ProxyRecord,
    pub deployment: DeployReceipt,
    pub initialization: CallReceipt,
}

pub struct ProxyProvisioner<'a> {
    client: &'a dyn ChainClient,
    proxy_artifact: &'a ContractArtifact,
}

impl<'a> ProxyProvisioner<'a> {
    /// `proxy_artifact` must take `(address implementation, bytes data)`
    pub fn new(client: &'a dyn ChainClient, proxy_artifact: &'a ContractArtifact) -> Self {
        Self { client, proxy_artifact }
    }

    /// Deploy the proxy and initialize it as one logical operation.
    ///
    /// Nothing is submitted unless every argument is resolved and encodes
    /// against the initializer. A failing initializer after a successful
    /// deployment is reported as
    /// [`ProvisionError::InitializationFailedAfterDeploy`] with the proxy
    /// address; it is never retried.
    pub fn provision_proxy(&self, request: ProvisionRequest<'_>) -> Result<ProvisionedProxy, ProvisionError> {
        let contract = &request.implementation_artifact.contract_name;
        let tokens = resolved_tokens(request.args)?;

        let function = request
            .implementation_artifact
            .abi
            .function(request.initializer)
            .map_err(|_| ProvisionError::UnknownInitializer {
                contract: contract.clone(),
                initializer: request.initializer.to_string(),
            })?;
        function
            .encode_input(&tokens)
            .map_err(|e| ProvisionError::InvalidInitializerArguments {
                initializer: request.initializer.to_string(),
                message: e.to_string(),
            })?;

        let layout = match &request.implementation_artifact.storage_layout {
            Some(layout) => layout.clone(),
            None => {
                warn!("{} carries no storage layout; its proxy cannot be upgraded safely", contract);
                Default::default()
            }
        };

        let deployment = self
            .client
            .deploy(
                self.proxy_artifact,
                &[Token::Address(request.implementation), Token::Bytes(Vec::new())],
            )
            .map_err(ProvisionError::Deploy)?;
        let proxy = deployment.address;
        info!(
            "Proxy {:?} deployed for {} at {:?} (tx {:?})",
            proxy, contract, request.implementation, deployment.transaction_hash
        );

        let record = ProxyRecord::new(proxy, request.implementation, contract, request.admin, layout);

        let initialization = match self
            .client
            .call(proxy, &request.implementation_artifact.abi, request.initializer, &tokens)
        {
            Ok(receipt) => receipt,
            Err(source) => {
                error!(
                    "Initializer {} failed on proxy {:?}; the proxy is deployed but uninitialized",
                    request.initializer, proxy
                );
                return Err(ProvisionError::InitializationFailedAfterDeploy {
                    proxy,
                    implementation: request.implementation,
                    source,
                });
            }
        };
        info!("Proxy {:?} initialized (tx {:?})", proxy, initialization.transaction_hash);

        Ok(ProvisionedProxy {
            record: record.initialized(),
            deployment,
            initialization,
        })
    }
}

fn resolved_tokens(args: &[ArgBinding]) -> Result<Vec<Token>, ProvisionError> {
    args.iter()
        .enumerate()
        .map(|(index, binding)| match binding {
            ArgBinding::Literal(value) => Ok(value.to_token()),
            ArgBinding::Ref(reference) => Err(ProvisionError::UnresolvedArgument {
                index,
                reference: reference.step.clone(),
            }),
        })
        .collect()
}
