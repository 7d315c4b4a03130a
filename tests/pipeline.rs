mod support;

use deploy_orchestrator::error::{ErrorCategory, OrchestratorError, PipelineError, PlanError, ProvisionError};
use deploy_orchestrator::ethereum::{ChainClient, ChainError, Submission};
use deploy_orchestrator::manifest::{DeploymentManifest, ManifestStatus};
use deploy_orchestrator::plan::{ArgBinding, DeploymentPlan, DeploymentStep};
use deploy_orchestrator::ProxyState;
use ethers::abi::Token;
use ethers::types::{Address, U256};
use tempfile::tempdir;

use support::{deployer, orchestrator, token_factory_plan};

fn revert(reason: &str) -> ChainError {
    ChainError::Reverted {
        tx_hash: None,
        reason: Some(reason.to_string()),
    }
}

#[test]
fn test_token_factory_plan_runs_in_dependency_order() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());

    let manifest = orchestrator.run_deployment_plan(&token_factory_plan()).unwrap();

    assert_eq!(manifest.status, ManifestStatus::Complete);
    assert_eq!(
        manifest.step_ids(),
        vec!["token_implementation", "bonding_curve", "position_manager", "token_factory"]
    );
    assert_eq!(manifest.deployer, deployer());
    assert_eq!(manifest.network.chain_id, Some(31337));

    let record = manifest.proxy("token_factory").unwrap();
    assert_eq!(record.state, ProxyState::Initialized);
    assert_eq!(record.admin, deployer());
    let factory = manifest.artifact("token_factory").unwrap();
    assert_eq!(factory.address, record.proxy_address);
    assert_eq!(factory.implementation, Some(record.current_implementation));

    // the initializer sees the addresses the earlier steps produced
    let address_of = |step: &str| Token::Address(manifest.artifact(step).unwrap().address);
    let weth: Address = "0xcF664087a5bB0237a0BAd6742852ec6c8d69A27a".parse().unwrap();
    let uniswap: Address = "0x12d21f5d0ab768c312e19653bf3f89917866b8e8".parse().unwrap();
    let submissions = orchestrator.client().submissions();
    assert_eq!(
        submissions.last(),
        Some(&Submission::Call {
            to: record.proxy_address,
            method: "initialize".to_string(),
            args: vec![
                address_of("token_implementation"),
                Token::Address(uniswap),
                address_of("position_manager"),
                address_of("bonding_curve"),
                Token::Address(weth),
                Token::Uint(U256::from(100u64)),
            ],
        })
    );

    // implementation, proxy, initializer on top of the three plain deployments
    assert_eq!(submissions.len(), 6);
    assert!(dir.path().join("localhost.json").exists());
}

#[test]
fn test_references_resolve_to_returned_addresses() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    let plan = DeploymentPlan::new(
        "three",
        vec![
            DeploymentStep::deploy("manager", "NonfungiblePositionManager")
                .arg(ArgBinding::output_of("token"))
                .arg(ArgBinding::output_of("curve"))
                .arg(ArgBinding::address(Address::zero()))
                .after("token")
                .after("curve"),
            DeploymentStep::deploy("token", "Token"),
            DeploymentStep::deploy("curve", "BancorBondingCurve")
                .arg(ArgBinding::uint(1_000_000u64))
                .arg(ArgBinding::uint(1_000_000u64)),
        ],
    );

    let manifest = orchestrator.run_deployment_plan(&plan).unwrap();
    let token = manifest.artifact("token").unwrap().address;
    let curve = manifest.artifact("curve").unwrap().address;

    let submissions = orchestrator.client().submissions();
    assert_eq!(
        submissions[2],
        Submission::Deploy {
            contract: "NonfungiblePositionManager".to_string(),
            args: vec![Token::Address(token), Token::Address(curve), Token::Address(Address::zero())],
        }
    );
}

#[test]
fn test_order_is_deterministic() {
    let plan = token_factory_plan();
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());

    let first = orchestrator.plan_order(&plan).unwrap();
    for _ in 0..5 {
        assert_eq!(orchestrator.plan_order(&plan).unwrap(), first);
    }
}

#[test]
fn test_cycle_submits_nothing() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    let plan = DeploymentPlan::new(
        "cyclic",
        vec![
            DeploymentStep::deploy("a", "Token").after("b"),
            DeploymentStep::deploy("b", "Token").after("a"),
        ],
    );

    let err = orchestrator.run_deployment_plan(&plan).unwrap_err();
    match &err {
        OrchestratorError::Pipeline(PipelineError::Plan(PlanError::CyclicDependency { cycle })) => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected cycle error, got {:?}", other),
    }
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(orchestrator.client().submissions().is_empty());
    assert!(!dir.path().join("localhost.json").exists());
}

#[test]
fn test_unknown_artifact_submits_nothing() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    let plan = DeploymentPlan::new(
        "missing",
        vec![
            DeploymentStep::deploy("token", "Token"),
            DeploymentStep::deploy("router", "SwapRouter"),
        ],
    );

    let err = orchestrator.run_deployment_plan(&plan).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Pipeline(PipelineError::Plan(PlanError::UnknownArtifact { .. }))
    ));
    assert!(orchestrator.client().submissions().is_empty());
}

#[test]
fn test_missing_initializer_is_detected_up_front() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    let mut step = DeploymentStep::proxy("factory", "TokenFactoryUpgradeable");
    step.initializer = Some("initializeV2".to_string());
    let plan = DeploymentPlan::new("bad-init", vec![step]);

    let err = orchestrator.run_deployment_plan(&plan).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Pipeline(PipelineError::Plan(PlanError::UnknownInitializer { .. }))
    ));
    assert!(orchestrator.client().submissions().is_empty());
}

#[test]
fn test_failed_step_halts_and_persists_partial_manifest() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    orchestrator
        .client()
        .fail_deploy("BancorBondingCurve", revert("reserve ratio out of range"));

    let plan = DeploymentPlan::new(
        "halt",
        vec![
            DeploymentStep::deploy("token", "Token"),
            DeploymentStep::deploy("curve", "BancorBondingCurve")
                .arg(ArgBinding::uint(1_000_000u64))
                .arg(ArgBinding::uint(1_000_000u64))
                .after("token"),
            DeploymentStep::deploy("manager", "NonfungiblePositionManager")
                .arg(ArgBinding::output_of("token"))
                .arg(ArgBinding::output_of("curve"))
                .arg(ArgBinding::address(Address::zero()))
                .after("token")
                .after("curve"),
        ],
    );

    let err = orchestrator.run_deployment_plan(&plan).unwrap_err();
    match &err {
        OrchestratorError::Pipeline(pipeline) => {
            assert_eq!(pipeline.step_id(), Some("curve"));
            assert!(matches!(
                pipeline,
                PipelineError::StepFailed { source, .. } if *source == revert("reserve ratio out of range")
            ));
        }
        other => panic!("expected step failure, got {:?}", other),
    }
    assert_eq!(err.category(), ErrorCategory::Transaction);

    // the third step never reached the chain
    assert_eq!(orchestrator.client().deploy_count(), 2);

    let manifest = DeploymentManifest::load(dir.path().join("localhost.json")).unwrap();
    assert_eq!(manifest.status, ManifestStatus::Partial);
    assert_eq!(manifest.step_ids(), vec!["token"]);
    let failure = manifest.failure.unwrap();
    assert_eq!(failure.step_id, "curve");
    assert_eq!(failure.category, ErrorCategory::Transaction);
    assert!(failure.error.contains("reserve ratio out of range"));
}

#[test]
fn test_failed_initializer_leaves_uninitialized_proxy_on_file() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    orchestrator.client().fail_call("initialize", revert("fee too high"));

    let err = orchestrator.run_deployment_plan(&token_factory_plan()).unwrap_err();
    let proxy = match &err {
        OrchestratorError::Pipeline(PipelineError::Provision {
            step_id,
            source: ProvisionError::InitializationFailedAfterDeploy { proxy, .. },
            ..
        }) => {
            assert_eq!(step_id, "token_factory");
            *proxy
        }
        other => panic!("expected InitializationFailedAfterDeploy, got {:?}", other),
    };
    assert_eq!(err.category(), ErrorCategory::PartialSideEffect);
    assert_eq!(orchestrator.client().contract_at(proxy).as_deref(), Some("ERC1967Proxy"));

    let manifest = DeploymentManifest::load(dir.path().join("localhost.json")).unwrap();
    assert_eq!(manifest.status, ManifestStatus::Partial);
    let record = manifest.proxy("token_factory").unwrap();
    assert_eq!(record.proxy_address, proxy);
    assert_eq!(record.state, ProxyState::Uninitialized);
    let failure = manifest.failure.as_ref().unwrap();
    assert_eq!(failure.category, ErrorCategory::PartialSideEffect);
    assert_eq!(
        failure.implementation.as_ref().map(|deployed| deployed.address),
        Some(record.current_implementation)
    );
}

#[test]
fn test_failed_proxy_deploy_keeps_implementation_on_file() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    orchestrator.client().fail_deploy(
        "ERC1967Proxy",
        ChainError::InsufficientFunds("insufficient funds for gas * price + value".to_string()),
    );

    let err = orchestrator.run_deployment_plan(&token_factory_plan()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transaction);
    let implementation = match &err {
        OrchestratorError::Pipeline(pipeline @ PipelineError::Provision { .. }) => {
            assert_eq!(pipeline.step_id(), Some("token_factory"));
            pipeline.deployed_implementation().unwrap().address
        }
        other => panic!("expected provisioning failure, got {:?}", other),
    };
    assert_eq!(
        orchestrator.client().contract_at(implementation).as_deref(),
        Some("TokenFactoryUpgradeable")
    );

    let manifest = DeploymentManifest::load(dir.path().join("localhost.json")).unwrap();
    assert_eq!(manifest.status, ManifestStatus::Partial);
    assert_eq!(
        manifest.step_ids(),
        vec!["token_implementation", "bonding_curve", "position_manager"]
    );
    assert!(manifest.proxy("token_factory").is_none());

    let failure = manifest.failure.unwrap();
    assert_eq!(failure.step_id, "token_factory");
    let stranded = failure.implementation.unwrap();
    assert_eq!(stranded.address, implementation);
    assert_eq!(stranded.contract, "TokenFactoryUpgradeable");
}

#[test]
fn test_confirmation_timeout_is_surfaced_distinctly() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    orchestrator.client().fail_deploy(
        "Token",
        ChainError::ConfirmationTimeout {
            tx_hash: Default::default(),
            waited: std::time::Duration::from_secs(120),
        },
    );

    let plan = DeploymentPlan::new("timeout", vec![DeploymentStep::deploy("token", "Token")]);
    let err = orchestrator.run_deployment_plan(&plan).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ConfirmationTimeout);

    // no resubmission
    assert_eq!(orchestrator.client().deploy_count(), 1);
}

#[test]
fn test_completed_manifest_round_trips() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());

    let manifest = orchestrator.run_deployment_plan(&token_factory_plan()).unwrap();
    let loaded = DeploymentManifest::load(dir.path().join("localhost.json")).unwrap();
    assert_eq!(loaded, manifest);

    let copy = dir.path().join("copy.json");
    loaded.save(&copy).unwrap();
    assert_eq!(DeploymentManifest::load(&copy).unwrap(), manifest);
    assert_eq!(orchestrator.client().sender(), manifest.deployer);
}
