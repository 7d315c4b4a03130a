// Deployment Orchestrator API Module
//
// This module provides the operator-facing entry points. It wires the chain
// client, the artifact store and the configuration into the pipeline and the
// upgrade controller.

mod config;

pub use config::*;

use std::path::Path;

use chrono::Utc;
use common::ProxyRecord;
use ethers::types::Address;
use log::{error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::error::{OrchestratorError, UpgradeError};
use crate::ethereum::chain::ChainRegistry;
use crate::ethereum::ChainClient;
use crate::manifest::{AuditEntry, AuditLog, AuditOutcome, DeploymentManifest, NetworkInfo};
use crate::pipeline::DeploymentPipeline;
use crate::plan::DeploymentPlan;
use crate::upgrade::{UpgradeController, UpgradeRequest};

/// Main API for the deployment orchestrator
///
/// An `Orchestrator` owns one chain client. Every transaction it sends goes
/// through that client, one at a time, so nonces of the deploying account are
/// always consumed in order.
///
/// # Examples
///
/// ```
/// use deploy_orchestrator::api::{ConfigManager, Orchestrator};
/// use deploy_orchestrator::artifacts::{ArtifactStore, ContractArtifact};
/// use deploy_orchestrator::ethereum::SimulatedChain;
/// use ethers::types::Address;
///
/// let mut artifacts = ArtifactStore::new();
/// artifacts.insert(ContractArtifact::from_human_readable("Token", &[]).unwrap());
///
/// let orchestrator = Orchestrator::new(
///     SimulatedChain::new(Address::from_low_u64_be(1)),
///     artifacts,
///     ConfigManager::builder().network("localhost").build(),
/// )
/// .unwrap();
///
/// assert_eq!(orchestrator.config().network, "localhost");
/// ```
pub struct Orchestrator<C: ChainClient> {
    client: C,
    artifacts: ArtifactStore,
    config: OrchestratorConfig,
}

impl<C: ChainClient> Orchestrator<C> {
    /// Create a new orchestrator
    ///
    /// # Arguments
    ///
    /// * `client` - Chain client every transaction is submitted through
    /// * `artifacts` - Pre-compiled contract artifacts
    /// * `config` - Orchestrator configuration
    ///
    /// # Returns
    ///
    /// An error if the confirmation timeout is shorter than the configured
    /// chain's block time, or if the upgrade function is not a valid
    /// single-address signature
    pub fn new(client: C, artifacts: ArtifactStore, config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        config.validate(&ChainRegistry::new())?;
        UpgradeController::new(&client, &config.proxy.upgrade_function)?;

        Ok(Self {
            client,
            artifacts,
            config,
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    fn network(&self) -> NetworkInfo {
        NetworkInfo {
            name: self.config.network.clone(),
            chain_id: self.config.chain_id,
        }
    }

    fn pipeline(&self) -> DeploymentPipeline<'_> {
        DeploymentPipeline::new(&self.client, &self.artifacts, self.network())
            .with_proxy_artifact(&self.config.proxy.artifact)
            .with_manifest_path(&self.config.manifest_path)
    }

    /// Validate a plan and return its execution order without submitting
    /// anything
    ///
    /// # Arguments
    ///
    /// * `plan` - The deployment plan to check
    ///
    /// # Examples
    ///
    /// ```
    /// use deploy_orchestrator::api::{ConfigManager, Orchestrator};
    /// use deploy_orchestrator::artifacts::{ArtifactStore, ContractArtifact};
    /// use deploy_orchestrator::ethereum::SimulatedChain;
    /// use deploy_orchestrator::plan::{ArgBinding, DeploymentPlan, DeploymentStep};
    /// use ethers::types::Address;
    ///
    /// let mut artifacts = ArtifactStore::new();
    /// artifacts.insert(ContractArtifact::from_human_readable("Token", &[]).unwrap());
    /// artifacts.insert(
    ///     ContractArtifact::from_human_readable("Vault", &["constructor(address token)"]).unwrap(),
    /// );
    ///
    /// let plan = DeploymentPlan::new(
    ///     "vault",
    ///     vec![
    ///         DeploymentStep::deploy("vault", "Vault")
    ///             .arg(ArgBinding::output_of("token"))
    ///             .after("token"),
    ///         DeploymentStep::deploy("token", "Token"),
    ///     ],
    /// );
    ///
    /// let orchestrator = Orchestrator::new(
    ///     SimulatedChain::new(Address::from_low_u64_be(1)),
    ///     artifacts,
    ///     ConfigManager::builder().build(),
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(orchestrator.plan_order(&plan).unwrap(), vec!["token", "vault"]);
    /// ```
    pub fn plan_order(&self, plan: &DeploymentPlan) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.pipeline().validate(plan)?)
    }

    /// Run a deployment plan and persist its manifest
    ///
    /// The manifest is written to the configured manifest path whether the run
    /// succeeds or not. A failed run leaves a manifest with status `partial`
    /// naming the failed step.
    ///
    /// # Arguments
    ///
    /// * `plan` - The deployment plan to execute
    ///
    /// # Returns
    ///
    /// The complete manifest, or the error of the first failing step
    ///
    /// # Examples
    ///
    /// ```
    /// use deploy_orchestrator::api::{ConfigManager, Orchestrator};
    /// use deploy_orchestrator::artifacts::{ArtifactStore, ContractArtifact};
    /// use deploy_orchestrator::ethereum::SimulatedChain;
    /// use deploy_orchestrator::plan::{DeploymentPlan, DeploymentStep};
    /// use ethers::types::Address;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let mut artifacts = ArtifactStore::new();
    /// artifacts.insert(ContractArtifact::from_human_readable("Token", &[]).unwrap());
    ///
    /// let config = ConfigManager::builder()
    ///     .manifest_path(dir.path().join("localhost.json"))
    ///     .build();
    /// let orchestrator = Orchestrator::new(SimulatedChain::new(Address::from_low_u64_be(1)), artifacts, config).unwrap();
    ///
    /// let plan = DeploymentPlan::new("token", vec![DeploymentStep::deploy("token", "Token")]);
    /// let manifest = orchestrator.run_deployment_plan(&plan).unwrap();
    ///
    /// assert!(manifest.is_complete());
    /// assert_eq!(manifest.step_ids(), vec!["token"]);
    /// ```
    pub fn run_deployment_plan(&self, plan: &DeploymentPlan) -> Result<DeploymentManifest, OrchestratorError> {
        Ok(self.pipeline().run(plan)?)
    }

    /// Upgrade a proxy recorded in a manifest
    ///
    /// The proxy is looked up by the id of the step that provisioned it. Every
    /// attempt that reaches a recorded proxy is appended to the audit log; a
    /// successful upgrade also rewrites the manifest with the new record. The
    /// manifest is written before the audit entry, and a failed audit write is
    /// logged rather than returned.
    ///
    /// # Arguments
    ///
    /// * `manifest_path` - Manifest written by a previous run
    /// * `proxy_name` - Step id of the proxy deployment
    /// * `new_implementation` - Artifact name of the new implementation
    /// * `caller` - Account requesting the upgrade; must be the recorded admin
    ///
    /// # Returns
    ///
    /// The updated proxy record
    pub fn upgrade_proxy<P: AsRef<Path>>(
        &self,
        manifest_path: P,
        proxy_name: &str,
        new_implementation: &str,
        caller: Address,
    ) -> Result<ProxyRecord, OrchestratorError> {
        let manifest_path = manifest_path.as_ref();
        let mut manifest = DeploymentManifest::load(manifest_path)?;
        let record = manifest
            .proxy(proxy_name)
            .cloned()
            .ok_or_else(|| UpgradeError::UnknownProxy(proxy_name.to_string()))?;

        let result = self.attempt_upgrade(&record, new_implementation, caller);

        let outcome = match &result {
            Ok(updated) => AuditOutcome::Upgraded {
                new_implementation: updated.current_implementation,
            },
            Err(e) => AuditOutcome::Rejected {
                category: e.category(),
                error: e.to_string(),
            },
        };
        let entry = AuditEntry {
            timestamp: Utc::now(),
            proxy_name: proxy_name.to_string(),
            proxy_address: record.proxy_address,
            requested_by: caller,
            previous_implementation: record.current_implementation,
            previous_contract: record.implementation_contract.clone(),
            requested_contract: new_implementation.to_string(),
            outcome,
        };

        let updated = match result {
            Ok(updated) => updated,
            Err(e) => {
                warn!("Upgrade of {} rejected: {}", proxy_name, e);
                self.audit(&entry);
                return Err(e);
            }
        };

        // the proxy already runs the new implementation; record it first
        manifest.record_proxy(proxy_name, updated.clone());
        let saved = manifest.save(manifest_path);
        self.audit(&entry);
        if let Err(e) = saved {
            error!(
                "Proxy {:?} now runs {:?} but the manifest could not be updated",
                updated.proxy_address, updated.current_implementation
            );
            return Err(e.into());
        }

        info!(
            "Proxy {} upgraded to {} at {:?}",
            proxy_name, updated.implementation_contract, updated.current_implementation
        );
        Ok(updated)
    }

    /// Append to the audit log. A write failure is logged and never undoes or
    /// masks the outcome of the attempt.
    fn audit(&self, entry: &AuditEntry) {
        if let Err(e) = AuditLog::new(&self.config.audit_log).append(entry) {
            error!(
                "Failed to audit upgrade of {} ({:?}) to {}: {}",
                entry.proxy_name, entry.proxy_address, entry.requested_contract, e
            );
        }
    }

    fn attempt_upgrade(
        &self,
        record: &ProxyRecord,
        new_implementation: &str,
        caller: Address,
    ) -> Result<ProxyRecord, OrchestratorError> {
        let artifact = self.artifacts.get(new_implementation)?;
        let controller = UpgradeController::new(&self.client, &self.config.proxy.upgrade_function)?;
        let updated = controller.upgrade(
            record,
            UpgradeRequest {
                proxy_address: record.proxy_address,
                new_implementation: artifact,
                requested_by: caller,
            },
        )?;
        Ok(updated)
    }
}
