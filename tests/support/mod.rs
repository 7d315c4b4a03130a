#![allow(dead_code)]

use std::path::Path;

use deploy_orchestrator::api::{ConfigManager, Orchestrator};
use deploy_orchestrator::artifacts::{ArtifactStore, ContractArtifact};
use deploy_orchestrator::ethereum::SimulatedChain;
use deploy_orchestrator::plan::DeploymentPlan;
use deploy_orchestrator::{StorageEntry, StorageLayout};
use ethers::types::Address;

pub const FACTORY_INITIALIZER: &str =
    "function initialize(address tokenImplementation, address uniswapV3Factory, address positionManager, address bondingCurve, address weth, uint256 feePercent)";

pub fn deployer() -> Address {
    Address::from_low_u64_be(0xd00d)
}

pub fn factory_layout_v1() -> StorageLayout {
    StorageLayout::new(vec![
        StorageEntry::new("_initialized", 0, 0, "t_uint8"),
        StorageEntry::new("_initializing", 0, 1, "t_bool"),
        StorageEntry::new("_owner", 51, 0, "t_address"),
        StorageEntry::new("tokenImplementation", 101, 0, "t_address"),
        StorageEntry::new("bondingCurve", 102, 0, "t_contract(IBondingCurve)1234"),
        StorageEntry::new("feePercent", 103, 0, "t_uint256"),
    ])
}

fn factory_artifact(name: &str, layout: StorageLayout) -> ContractArtifact {
    ContractArtifact::from_human_readable(name, &[FACTORY_INITIALIZER])
        .unwrap()
        .with_storage_layout(layout)
}

/// Artifacts of the token factory application plus several candidate upgrades
pub fn artifacts() -> ArtifactStore {
    let mut store = ArtifactStore::new();
    store.insert(ContractArtifact::from_human_readable("Token", &["function initialize(string name, string symbol)"]).unwrap());
    store.insert(
        ContractArtifact::from_human_readable(
            "BancorBondingCurve",
            &["constructor(uint256 reserveRatio, uint256 initialSupply)"],
        )
        .unwrap(),
    );
    store.insert(
        ContractArtifact::from_human_readable(
            "NonfungiblePositionManager",
            &["constructor(address factory, address weth9, address tokenDescriptor)"],
        )
        .unwrap(),
    );
    store.insert(
        ContractArtifact::from_human_readable("ERC1967Proxy", &["constructor(address logic, bytes data)"]).unwrap(),
    );
    store.insert(factory_artifact("TokenFactoryUpgradeable", factory_layout_v1()));

    // compatible: appends a slot, AST ids differ
    let mut v2 = factory_layout_v1();
    v2.storage[4].type_name = "t_contract(IBondingCurve)5678".to_string();
    v2.storage.push(StorageEntry::new("treasury", 104, 0, "t_address"));
    store.insert(factory_artifact("TokenFactory", v2));

    let mut retyped = factory_layout_v1();
    retyped.storage[5].type_name = "t_uint128".to_string();
    store.insert(factory_artifact("TokenFactoryRetyped", retyped));

    let mut removed = factory_layout_v1();
    removed.storage.pop();
    store.insert(factory_artifact("TokenFactoryTrimmed", removed));

    store.insert(ContractArtifact::from_human_readable("TokenFactoryUnchecked", &[FACTORY_INITIALIZER]).unwrap());

    store
}

pub fn token_factory_plan() -> DeploymentPlan {
    DeploymentPlan::load(Path::new(env!("CARGO_MANIFEST_DIR")).join("plans/token_factory.json")).unwrap()
}

/// Orchestrator over a fresh simulated chain writing into `dir`
pub fn orchestrator(dir: &Path) -> Orchestrator<SimulatedChain> {
    let config = ConfigManager::builder()
        .network("localhost")
        .chain_id(31337)
        .manifest_path(dir.join("localhost.json"))
        .audit_log(dir.join("upgrades.jsonl"))
        .build();
    Orchestrator::new(SimulatedChain::new(deployer()), artifacts(), config).unwrap()
}
