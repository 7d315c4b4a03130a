// Pre-compiled contract artifacts
//
// Artifacts are read in the hardhat JSON format. Only the fields the
// orchestrator needs are kept; solc's `storageLayout` output is picked up when
// the artifact carries it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use common::StorageLayout;
use ethers::abi::{parse_abi, Abi};
use ethers::types::Bytes;
use log::debug;
use serde::Deserialize;

use crate::error::ArtifactError;

/// Compiled contract: ABI, creation bytecode and optional storage layout
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractArtifact {
    pub contract_name: String,
    pub abi: Abi,
    #[serde(default)]
    pub bytecode: Bytes,
    #[serde(default)]
    pub storage_layout: Option<StorageLayout>,
}

impl ContractArtifact {
    /// Build an artifact from human readable ABI signatures such as
    /// `constructor(address logic, bytes data)` or `function initialize(uint256 fee)`
    pub fn from_human_readable(contract_name: &str, signatures: &[&str]) -> Result<Self, ArtifactError> {
        let abi = parse_abi(signatures).map_err(|e| ArtifactError::Abi {
            contract: contract_name.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            contract_name: contract_name.to_string(),
            abi,
            // PUSH1 0x80 PUSH1 0x40 MSTORE
            bytecode: Bytes::from(vec![0x60, 0x80, 0x60, 0x40, 0x52]),
            storage_layout: None,
        })
    }

    pub fn with_storage_layout(mut self, layout: StorageLayout) -> Self {
        self.storage_layout = Some(layout);
        self
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.abi.function(name).is_ok()
    }

    /// Parse a single hardhat artifact file
    pub fn load_file(path: &Path) -> Result<Self, ArtifactError> {
        let text = fs::read_to_string(path).map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ArtifactError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Artifacts addressable by contract name
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    artifacts: HashMap<String, ContractArtifact>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every artifact below `dir`.
    ///
    /// Walks the directory recursively (hardhat nests artifacts per source
    /// file), skipping `*.dbg.json` and JSON files without `contractName`/`abi`,
    /// such as build-info files.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ArtifactError> {
        let mut store = Self::new();
        let mut pending = vec![dir.as_ref().to_path_buf()];

        while let Some(current) = pending.pop() {
            let entries = fs::read_dir(&current).map_err(|source| ArtifactError::Io {
                path: current.clone(),
                source,
            })?;

            for entry in entries {
                let path = entry
                    .map_err(|source| ArtifactError::Io {
                        path: current.clone(),
                        source,
                    })?
                    .path();

                if path.is_dir() {
                    pending.push(path);
                } else if is_artifact_candidate(&path) {
                    if let Some(artifact) = load_if_artifact(&path)? {
                        debug!("Loaded artifact {} from {}", artifact.contract_name, path.display());
                        store.insert(artifact);
                    }
                }
            }
        }

        Ok(store)
    }

    pub fn insert(&mut self, artifact: ContractArtifact) {
        self.artifacts.insert(artifact.contract_name.clone(), artifact);
    }

    pub fn get(&self, name: &str) -> Result<&ContractArtifact, ArtifactError> {
        self.artifacts
            .get(name)
            .ok_or_else(|| ArtifactError::Unknown(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

fn is_artifact_candidate(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.ends_with(".json") && !name.ends_with(".dbg.json")
}

fn load_if_artifact(path: &PathBuf) -> Result<Option<ContractArtifact>, ArtifactError> {
    let text = fs::read_to_string(path).map_err(|source| ArtifactError::Io {
        path: path.clone(),
        source,
    })?;
    let value: serde_json::Value = serde_json::from_str(&text).map_err(|source| ArtifactError::Parse {
        path: path.clone(),
        source,
    })?;

    if value.get("contractName").is_none() || value.get("abi").is_none() {
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|source| ArtifactError::Parse {
            path: path.clone(),
            source,
        })
}
