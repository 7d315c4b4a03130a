// Deployment Orchestrator CLI
//
// Command-line front end for planning, running and upgrading deployments.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use deploy_orchestrator::api::{ConfigManager, OrchestratorConfig, Orchestrator};
use deploy_orchestrator::artifacts::ArtifactStore;
use deploy_orchestrator::ethereum::chain::ChainRegistry;
use deploy_orchestrator::ethereum::{ChainClient, EthereumConnector, SimulatedChain};
use deploy_orchestrator::plan::DeploymentPlan;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use log::{info, warn};

/// Deployment Orchestrator - ordered contract deployment and safe proxy upgrades
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a plan and print its execution order
    Plan {
        /// Path to the deployment plan
        #[clap(short, long)]
        plan: PathBuf,

        /// Path to configuration file
        #[clap(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a deployment plan
    Deploy {
        /// Path to the deployment plan
        #[clap(short, long)]
        plan: PathBuf,

        /// Path to configuration file
        #[clap(short, long)]
        config: Option<PathBuf>,

        /// Run against an in-memory chain; the manifest gets a `.dry-run` suffix
        #[clap(long)]
        dry_run: bool,
    },

    /// Upgrade a proxy recorded in a manifest
    Upgrade {
        /// Manifest written by a previous deployment
        #[clap(short, long)]
        manifest: PathBuf,

        /// Step id of the proxy deployment
        #[clap(long)]
        proxy: String,

        /// Artifact name of the new implementation
        #[clap(short, long)]
        implementation: String,

        /// Account requesting the upgrade
        #[clap(long)]
        caller: String,

        /// Path to configuration file
        #[clap(short, long)]
        config: Option<PathBuf>,
    },

    /// Generate a default configuration file
    Config {
        /// Output file path
        #[clap(short, long)]
        output: PathBuf,
    },

    /// List known chains
    Chains,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { plan, config } => {
            let config = load_config(config.as_deref())?;
            let plan = DeploymentPlan::load(&plan)?;
            let orchestrator = Orchestrator::new(SimulatedChain::new(Address::zero()), load_artifacts(&config)?, config)?;

            let order = orchestrator.plan_order(&plan)?;
            println!("Plan {} ({} steps):", plan.name, order.len());
            for (index, step) in order.iter().enumerate() {
                println!("  {}. {}", index + 1, step);
            }
            Ok(())
        }
        Commands::Deploy { plan, config, dry_run } => {
            let mut config = load_config(config.as_deref())?;
            let plan = DeploymentPlan::load(&plan)?;
            let artifacts = load_artifacts(&config)?;

            let manifest = if dry_run {
                config.manifest_path = dry_run_path(&config.manifest_path);
                let sender = match env::var("DEPLOYER_PRIVATE_KEY") {
                    Ok(key) => key.trim().parse::<LocalWallet>().context("Invalid DEPLOYER_PRIVATE_KEY")?.address(),
                    Err(_) => Address::from_low_u64_be(1),
                };
                info!("Dry run as {:?}", sender);
                let chain = SimulatedChain::new(sender).with_proxy_contract(&config.proxy.artifact);
                Orchestrator::new(chain, artifacts, config)?.run_deployment_plan(&plan)?
            } else {
                let connector = connect(&mut config)?;
                Orchestrator::new(connector, artifacts, config)?.run_deployment_plan(&plan)?
            };

            println!("Deployment {} complete ({:?})", manifest.plan, manifest.status);
            for artifact in &manifest.artifacts {
                println!("  {:<24} {:<28} {:?}", artifact.step_id, artifact.contract, artifact.address);
            }
            Ok(())
        }
        Commands::Upgrade { manifest, proxy, implementation, caller, config } => {
            let caller: Address = caller
                .parse()
                .map_err(|e| anyhow!("Invalid caller address {}: {}", caller, e))?;
            let mut config = load_config(config.as_deref())?;
            let artifacts = load_artifacts(&config)?;
            let connector = connect(&mut config)?;
            if connector.sender() != caller {
                warn!("Caller {:?} is not the signing account {:?}", caller, connector.sender());
            }

            let orchestrator = Orchestrator::new(connector, artifacts, config)?;
            let record = orchestrator.upgrade_proxy(&manifest, &proxy, &implementation, caller)?;
            println!(
                "Proxy {} ({:?}) now points to {} at {:?}",
                proxy, record.proxy_address, record.implementation_contract, record.current_implementation
            );
            Ok(())
        }
        Commands::Config { output } => {
            let config = OrchestratorConfig::default();
            ConfigManager::save_to_file(&config, &output).context("Failed to save configuration")?;
            println!("Default configuration saved to {:?}", output);
            Ok(())
        }
        Commands::Chains => {
            for chain in ChainRegistry::new().chains() {
                println!(
                    "{:>10}  {:<10} {:<24} {}s blocks",
                    chain.chain_id, chain.network, chain.name, chain.block_time
                );
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let mut config = match path {
        Some(path) => ConfigManager::load_from_file(path).context("Failed to load configuration")?,
        None => OrchestratorConfig::default(),
    };
    if let Ok(rpc_url) = env::var("RPC_URL") {
        config.rpc_url = rpc_url;
    }
    Ok(config)
}

fn load_artifacts(config: &OrchestratorConfig) -> Result<ArtifactStore> {
    let store = ArtifactStore::load_dir(&config.artifacts_dir)
        .with_context(|| format!("Failed to load artifacts from {}", config.artifacts_dir.display()))?;
    info!("Loaded {} artifacts", store.len());
    Ok(store)
}

/// Connect to the configured node and pin the chain id in the configuration
fn connect(config: &mut OrchestratorConfig) -> Result<EthereumConnector> {
    let key = env::var("DEPLOYER_PRIVATE_KEY").context("DEPLOYER_PRIVATE_KEY is not set")?;
    let connector = EthereumConnector::new(&config.rpc_url, &key, config.confirmation_timeout())
        .with_context(|| format!("Failed to connect to {}", config.rpc_url))?;

    match config.chain_id {
        Some(expected) if expected != connector.chain_id() => {
            bail!(
                "{} serves chain {} but the configuration expects {}",
                config.rpc_url,
                connector.chain_id(),
                expected
            );
        }
        Some(_) => {}
        None => config.chain_id = Some(connector.chain_id()),
    }
    Ok(connector)
}

fn dry_run_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("manifest");
    path.with_file_name(format!("{}.dry-run.json", stem))
}
