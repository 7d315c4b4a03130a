// Deployment plan model
//
// A plan is a declarative list of steps. Each step deploys an artifact,
// optionally behind a proxy, with arguments that are either literal values or
// outputs of earlier steps.

pub mod graph;

use std::fmt;
use std::fs;
use std::path::Path;

use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

use crate::error::PlanError;

pub use graph::{execution_order, DependencyGraph};

/// Initializer invoked through a proxy when the step does not name one
pub const DEFAULT_INITIALIZER: &str = "initialize";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Logical name of the application being deployed
    pub name: String,
    pub steps: Vec<DeploymentStep>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Deploy,
    ProxyDeploy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub id: String,
    #[serde(default)]
    pub kind: StepKind,
    /// Artifact name; for proxy steps this is the implementation
    pub artifact: String,
    /// Constructor arguments, or initializer arguments for proxy steps
    #[serde(default)]
    pub args: Vec<ArgBinding>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<String>,
    /// Account allowed to upgrade the proxy; defaults to the deployer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<Address>,
}

/// Source of one argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgBinding {
    Literal(ArgValue),
    Ref(StepRef),
}

/// Reference to an output of another step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub step: String,
    #[serde(default)]
    pub field: OutputField,
}

/// Outputs a completed step exposes to later steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputField {
    #[default]
    Address,
    /// Implementation behind a proxy step
    Implementation,
    TransactionHash,
    BlockNumber,
}

impl fmt::Display for OutputField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputField::Address => "address",
            OutputField::Implementation => "implementation",
            OutputField::TransactionHash => "transaction_hash",
            OutputField::BlockNumber => "block_number",
        };
        f.write_str(name)
    }
}

/// Typed literal argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Address(Address),
    Uint(#[serde(with = "common::utils::u256_dec")] U256),
    Bool(bool),
    String(String),
    Bytes(Bytes),
    Bytes32(H256),
}

impl ArgValue {
    pub fn to_token(&self) -> Token {
        match self {
            ArgValue::Address(address) => Token::Address(*address),
            ArgValue::Uint(value) => Token::Uint(*value),
            ArgValue::Bool(value) => Token::Bool(*value),
            ArgValue::String(value) => Token::String(value.clone()),
            ArgValue::Bytes(value) => Token::Bytes(value.to_vec()),
            ArgValue::Bytes32(value) => Token::FixedBytes(value.as_bytes().to_vec()),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Address(address) => write!(f, "{:?}", address),
            ArgValue::Uint(value) => write!(f, "{}", value),
            ArgValue::Bool(value) => write!(f, "{}", value),
            ArgValue::String(value) => write!(f, "{:?}", value),
            ArgValue::Bytes(value) => write!(f, "{}", value),
            ArgValue::Bytes32(value) => write!(f, "{:?}", value),
        }
    }
}

impl ArgBinding {
    pub fn address(address: Address) -> Self {
        ArgBinding::Literal(ArgValue::Address(address))
    }

    pub fn uint<V: Into<U256>>(value: V) -> Self {
        ArgBinding::Literal(ArgValue::Uint(value.into()))
    }

    /// Address produced by `step`
    pub fn output_of(step: &str) -> Self {
        Self::field_of(step, OutputField::Address)
    }

    pub fn field_of(step: &str, field: OutputField) -> Self {
        ArgBinding::Ref(StepRef {
            step: step.to_string(),
            field,
        })
    }

    pub fn as_reference(&self) -> Option<&StepRef> {
        match self {
            ArgBinding::Ref(reference) => Some(reference),
            ArgBinding::Literal(_) => None,
        }
    }
}

impl DeploymentStep {
    pub fn deploy(id: &str, artifact: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: StepKind::Deploy,
            artifact: artifact.to_string(),
            args: Vec::new(),
            depends_on: Vec::new(),
            initializer: None,
            admin: None,
        }
    }

    pub fn proxy(id: &str, implementation: &str) -> Self {
        Self {
            kind: StepKind::ProxyDeploy,
            ..Self::deploy(id, implementation)
        }
    }

    pub fn arg(mut self, binding: ArgBinding) -> Self {
        self.args.push(binding);
        self
    }

    pub fn after(mut self, step: &str) -> Self {
        if !self.depends_on.iter().any(|d| d == step) {
            self.depends_on.push(step.to_string());
        }
        self
    }

    pub fn initializer_name(&self) -> &str {
        self.initializer.as_deref().unwrap_or(DEFAULT_INITIALIZER)
    }

    /// Step references used by the argument list, in argument order
    pub fn references(&self) -> impl Iterator<Item = &StepRef> {
        self.args.iter().filter_map(ArgBinding::as_reference)
    }
}

impl DeploymentPlan {
    pub fn new(name: &str, steps: Vec<DeploymentStep>) -> Self {
        Self {
            name: name.to_string(),
            steps,
        }
    }

    pub fn step(&self, id: &str) -> Option<&DeploymentStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn has_proxy_steps(&self) -> bool {
        self.steps.iter().any(|step| step.kind == StepKind::ProxyDeploy)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let load_error = |message: String| PlanError::Load {
            path: path.to_path_buf(),
            message,
        };
        let text = fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        Self::from_json(&text).map_err(|e| load_error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_json_shape() {
        let plan = DeploymentPlan::from_json(
            r#"{
                "name": "demo",
                "steps": [
                    {"id": "curve", "artifact": "BancorBondingCurve",
                     "args": [{"literal": {"uint": "1000000"}}, {"literal": {"uint": 5}}]},
                    {"id": "factory", "kind": "proxy_deploy", "artifact": "TokenFactoryUpgradeable",
                     "args": [{"ref": {"step": "curve"}}, {"ref": {"step": "curve", "field": "block_number"}}],
                     "depends_on": ["curve"]}
                ]
            }"#,
        )
        .unwrap();

        let curve = plan.step("curve").unwrap();
        assert_eq!(curve.kind, StepKind::Deploy);
        assert_eq!(curve.args[0], ArgBinding::uint(1_000_000u64));
        assert_eq!(curve.args[1], ArgBinding::uint(5u64));

        let factory = plan.step("factory").unwrap();
        assert_eq!(factory.kind, StepKind::ProxyDeploy);
        assert_eq!(factory.initializer_name(), DEFAULT_INITIALIZER);
        let fields: Vec<_> = factory.references().map(|r| r.field).collect();
        assert_eq!(fields, vec![OutputField::Address, OutputField::BlockNumber]);
    }

    #[test]
    fn test_unknown_output_field_is_rejected() {
        let result = DeploymentPlan::from_json(
            r#"{"name": "x", "steps": [{"id": "a", "artifact": "A", "args": [{"ref": {"step": "b", "field": "owner"}}]}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_literal_tokens() {
        let weth: Address = "0xcF664087a5bB0237a0BAd6742852ec6c8d69A27a".parse().unwrap();
        assert_eq!(ArgValue::Address(weth).to_token(), Token::Address(weth));
        assert_eq!(ArgValue::Uint(U256::from(100u64)).to_token(), Token::Uint(U256::from(100u64)));
        assert_eq!(ArgValue::Bytes(Bytes::default()).to_token(), Token::Bytes(Vec::new()));
    }

    #[test]
    fn test_shipped_token_factory_plan_parses() {
        let plan = DeploymentPlan::from_json(include_str!("../../plans/token_factory.json")).unwrap();
        assert_eq!(plan.steps.len(), 4);
        assert!(plan.has_proxy_steps());
        assert_eq!(plan.step("token_factory").unwrap().args.len(), 6);
    }
}
