// Deployment pipeline
//
// Runs a validated plan step by step against one chain client. The manifest is
// built up locally and persisted on both success and failure; a failed run is
// never resumed and never rolled back.

use std::collections::HashMap;
use std::path::PathBuf;

use common::{DeployedArtifact, ProxyRecord};
use ethers::abi::Token;
use ethers::types::Address;
use log::{debug, error, info, warn};

use crate::artifacts::{ArtifactStore, ContractArtifact};
use crate::error::{PipelineError, PlanError, ProvisionError};
use crate::ethereum::ChainClient;
use crate::manifest::{DeploymentManifest, NetworkInfo};
use crate::plan::{execution_order, ArgBinding, ArgValue, DeploymentPlan, DeploymentStep, OutputField, StepKind, StepRef};
use crate::provisioner::{ProvisionRequest, ProxyProvisioner};

pub struct DeploymentPipeline<'a> {
    client: &'a dyn ChainClient,
    artifacts: &'a ArtifactStore,
    proxy_artifact: String,
    network: NetworkInfo,
    manifest_path: Option<PathBuf>,
}

impl<'a> DeploymentPipeline<'a> {
    pub fn new(client: &'a dyn ChainClient, artifacts: &'a ArtifactStore, network: NetworkInfo) -> Self {
        Self {
            client,
            artifacts,
            proxy_artifact: "ERC1967Proxy".to_string(),
            network,
            manifest_path: None,
        }
    }

    /// Artifact deployed in front of `proxy_deploy` implementations
    pub fn with_proxy_artifact(mut self, name: &str) -> Self {
        self.proxy_artifact = name.to_string();
        self
    }

    /// Persist the manifest here at the end of every run
    pub fn with_manifest_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    /// Check the plan graph and every artifact it needs; returns the
    /// execution order. Submits nothing.
    pub fn validate(&self, plan: &DeploymentPlan) -> Result<Vec<String>, PlanError> {
        let order = execution_order(plan)?;

        for step in &plan.steps {
            let artifact = self.artifacts.get(&step.artifact).map_err(|_| PlanError::UnknownArtifact {
                step: step.id.clone(),
                artifact: step.artifact.clone(),
            })?;

            if step.kind == StepKind::ProxyDeploy {
                if !self.artifacts.contains(&self.proxy_artifact) {
                    return Err(PlanError::UnknownArtifact {
                        step: step.id.clone(),
                        artifact: self.proxy_artifact.clone(),
                    });
                }
                if !artifact.has_function(step.initializer_name()) {
                    return Err(PlanError::UnknownInitializer {
                        step: step.id.clone(),
                        contract: artifact.contract_name.clone(),
                        initializer: step.initializer_name().to_string(),
                    });
                }
            }
        }

        Ok(order)
    }

    /// Execute `plan`.
    ///
    /// Plan problems are reported before anything is submitted. The first
    /// failing step stops the run; the manifest is then persisted with status
    /// `partial` and a failure record naming that step.
    pub fn run(&self, plan: &DeploymentPlan) -> Result<DeploymentManifest, PipelineError> {
        let order = self.validate(plan)?;
        info!("Running plan {} with {} steps on {}", plan.name, order.len(), self.network.name);

        let mut manifest = DeploymentManifest::new(&plan.name, self.network.clone(), self.client.sender());
        let mut outputs: HashMap<String, DeployedArtifact> = HashMap::new();

        for step_id in &order {
            let step = plan
                .step(step_id)
                .ok_or_else(|| PipelineError::MissingStep(step_id.clone()))?;

            match self.execute_step(step, &outputs) {
                Ok(StepOutcome { artifact, proxy }) => {
                    if let Some(record) = proxy {
                        manifest.record_proxy(step_id, record);
                    }
                    outputs.insert(step_id.clone(), artifact.clone());
                    manifest.record_artifact(artifact);
                }
                Err(err) => {
                    error!("Step {} failed: {}", step_id, err);
                    if let PipelineError::Provision {
                        source: ProvisionError::InitializationFailedAfterDeploy { proxy, implementation, .. },
                        ..
                    } = &err
                    {
                        let record = self.uninitialized_record(step, *proxy, *implementation);
                        manifest.record_proxy(step_id, record);
                    }
                    let implementation = err.deployed_implementation().cloned();
                    if let Some(stranded) = &implementation {
                        warn!(
                            "Step {} left implementation {} on chain at {:?}",
                            step_id, stranded.contract, stranded.address
                        );
                    }
                    manifest.mark_failed(step_id, err.category(), err.to_string(), implementation);
                    if let Err(save_error) = self.persist(&manifest) {
                        error!("Failed to persist partial manifest: {}", save_error);
                    }
                    return Err(err);
                }
            }
        }

        manifest.mark_complete();
        self.persist(&manifest)?;
        info!("Plan {} complete: {} artifacts", plan.name, manifest.artifacts.len());
        Ok(manifest)
    }

    fn persist(&self, manifest: &DeploymentManifest) -> Result<(), PipelineError> {
        if let Some(path) = &self.manifest_path {
            manifest.save(path)?;
        }
        Ok(())
    }

    fn execute_step(
        &self,
        step: &DeploymentStep,
        outputs: &HashMap<String, DeployedArtifact>,
    ) -> Result<StepOutcome, PipelineError> {
        let artifact = self.artifact(step, &step.artifact)?;
        let args = resolve_args(step, outputs)?;
        info!("Step {}: deploying {}", step.id, artifact.contract_name);
        debug!(
            "Step {} arguments: [{}]",
            step.id,
            args.iter().map(ArgValue::to_string).collect::<Vec<_>>().join(", ")
        );

        match step.kind {
            StepKind::Deploy => {
                let tokens: Vec<Token> = args.iter().map(ArgValue::to_token).collect();
                let receipt = self.client.deploy(artifact, &tokens).map_err(|source| PipelineError::StepFailed {
                    step_id: step.id.clone(),
                    source,
                })?;
                info!("Step {}: {} at {:?}", step.id, artifact.contract_name, receipt.address);

                Ok(StepOutcome {
                    artifact: DeployedArtifact {
                        step_id: step.id.clone(),
                        contract: artifact.contract_name.clone(),
                        address: receipt.address,
                        transaction_hash: receipt.transaction_hash,
                        block_number: receipt.block_number,
                        implementation: None,
                    },
                    proxy: None,
                })
            }
            StepKind::ProxyDeploy => {
                let proxy_artifact = self.artifact(step, &self.proxy_artifact)?;
                let implementation = self.client.deploy(artifact, &[]).map_err(|source| PipelineError::StepFailed {
                    step_id: step.id.clone(),
                    source,
                })?;
                info!("Step {}: implementation {} at {:?}", step.id, artifact.contract_name, implementation.address);
                let deployed_implementation = DeployedArtifact {
                    step_id: step.id.clone(),
                    contract: artifact.contract_name.clone(),
                    address: implementation.address,
                    transaction_hash: implementation.transaction_hash,
                    block_number: implementation.block_number,
                    implementation: None,
                };

                let bindings: Vec<ArgBinding> = args.into_iter().map(ArgBinding::Literal).collect();
                let provisioned = ProxyProvisioner::new(self.client, proxy_artifact)
                    .provision_proxy(ProvisionRequest {
                        implementation: implementation.address,
                        implementation_artifact: artifact,
                        initializer: step.initializer_name(),
                        args: &bindings,
                        admin: step.admin.unwrap_or_else(|| self.client.sender()),
                    })
                    .map_err(|source| PipelineError::Provision {
                        step_id: step.id.clone(),
                        implementation: deployed_implementation,
                        source,
                    })?;

                Ok(StepOutcome {
                    artifact: DeployedArtifact {
                        step_id: step.id.clone(),
                        contract: artifact.contract_name.clone(),
                        address: provisioned.deployment.address,
                        transaction_hash: provisioned.deployment.transaction_hash,
                        block_number: provisioned.deployment.block_number,
                        implementation: Some(implementation.address),
                    },
                    proxy: Some(provisioned.record),
                })
            }
        }
    }

    fn artifact(&self, step: &DeploymentStep, name: &str) -> Result<&'a ContractArtifact, PipelineError> {
        self.artifacts.get(name).map_err(|_| {
            PipelineError::Plan(PlanError::UnknownArtifact {
                step: step.id.clone(),
                artifact: name.to_string(),
            })
        })
    }

    fn uninitialized_record(
        &self,
        step: &DeploymentStep,
        proxy: Address,
        implementation: Address,
    ) -> ProxyRecord {
        let layout = self
            .artifacts
            .get(&step.artifact)
            .ok()
            .and_then(|artifact| artifact.storage_layout.clone())
            .unwrap_or_default();
        warn!("Recording uninitialized proxy {:?} for step {}", proxy, step.id);
        ProxyRecord::new(
            proxy,
            implementation,
            &step.artifact,
            step.admin.unwrap_or_else(|| self.client.sender()),
            layout,
        )
    }
}

struct StepOutcome {
    artifact: DeployedArtifact,
    proxy: Option<ProxyRecord>,
}

/// Replace every reference in the step's arguments with the referenced output
fn resolve_args(
    step: &DeploymentStep,
    outputs: &HashMap<String, DeployedArtifact>,
) -> Result<Vec<ArgValue>, PipelineError> {
    step.args
        .iter()
        .map(|binding| match binding {
            ArgBinding::Literal(value) => Ok(value.clone()),
            ArgBinding::Ref(reference) => resolve_ref(step, reference, outputs),
        })
        .collect()
}

fn resolve_ref(
    step: &DeploymentStep,
    reference: &StepRef,
    outputs: &HashMap<String, DeployedArtifact>,
) -> Result<ArgValue, PipelineError> {
    let unresolved = || PipelineError::UnresolvedReference {
        step_id: step.id.clone(),
        reference: reference.step.clone(),
        field: reference.field,
    };
    let output = outputs.get(&reference.step).ok_or_else(unresolved)?;

    match reference.field {
        OutputField::Address => Ok(ArgValue::Address(output.address)),
        OutputField::Implementation => output.implementation.map(ArgValue::Address).ok_or_else(unresolved),
        OutputField::TransactionHash => Ok(ArgValue::Bytes32(output.transaction_hash)),
        OutputField::BlockNumber => Ok(ArgValue::Uint(output.block_number.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    #[test]
    fn test_reference_resolution() {
        let step = DeploymentStep::deploy("pm", "NonfungiblePositionManager")
            .arg(ArgBinding::output_of("factory"))
            .arg(ArgBinding::field_of("factory", OutputField::Implementation))
            .arg(ArgBinding::field_of("factory", OutputField::BlockNumber))
            .after("factory");

        let mut outputs = HashMap::new();
        outputs.insert(
            "factory".to_string(),
            DeployedArtifact {
                step_id: "factory".to_string(),
                contract: "TokenFactoryUpgradeable".to_string(),
                address: Address::from_low_u64_be(9),
                transaction_hash: H256::repeat_byte(1),
                block_number: 42,
                implementation: Some(Address::from_low_u64_be(8)),
            },
        );

        let values = resolve_args(&step, &outputs).unwrap();
        assert_eq!(
            values,
            vec![
                ArgValue::Address(Address::from_low_u64_be(9)),
                ArgValue::Address(Address::from_low_u64_be(8)),
                ArgValue::Uint(42u64.into()),
            ]
        );
    }

    #[test]
    fn test_missing_output_is_an_invariant_violation() {
        let step = DeploymentStep::deploy("b", "B").arg(ArgBinding::output_of("a")).after("a");
        let err = resolve_args(&step, &HashMap::new()).unwrap_err();
        assert!(matches!(err, PipelineError::UnresolvedReference { ref step_id, .. } if step_id == "b"));
    }
}
