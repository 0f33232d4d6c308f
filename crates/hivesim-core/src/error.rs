//! Error taxonomy shared across the core.

use std::fmt;
use std::path::PathBuf;

use hivesim_index::IndexError;
use thiserror::Error;

use crate::value::ValueType;

/// Failures raised while resolving primitives in a frozen registry.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("no handler for `{keyword}` with signature {signature}")]
    NoHandler { keyword: String, signature: String },
    #[error("unknown type `{0}`")]
    UnknownType(String),
    #[error("unknown skill `{0}`")]
    UnknownSkill(String),
}

/// Language-level errors surfaced while compiling syntax trees.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("species `{species}` has no variable `{name}`")]
    UnknownVariable { species: String, name: String },
    #[error("unknown species `{0}`")]
    UnknownSpecies(String),
    #[error("species `{0}` is declared more than once")]
    DuplicateSpecies(String),
    #[error("species `{species}` has no action `{action}`")]
    UnknownAction { species: String, action: String },
    #[error("species `{species}` uses unknown skill `{skill}`")]
    UnknownSkill { species: String, skill: String },
    #[error("variable `{name}` expects {expected}, found {found}")]
    TypeMismatch {
        name: String,
        expected: ValueType,
        found: ValueType,
    },
    #[error("`{0}` requires a calling agent (use it inside `ask`)")]
    MissingCaller(&'static str),
    #[error("species `{0}` lacks the `social` skill required by `socialize`")]
    MissingSocialSkill(String),
    #[error("species inheritance cycle through `{0}`")]
    InheritanceCycle(String),
}

/// Evaluation failures raised while executing statements and expressions.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("agent {0} is no longer available")]
    AgentUnavailable(String),
    #[error("no agent is active in this scope")]
    NoCurrentAgent,
    #[error("no calling agent is on the stack")]
    NoCaller,
    #[error("scope `{0}` has been released")]
    ScopeReleased(String),
    #[error("the simulation has been disposed")]
    SimulationDisposed,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: ValueType,
        found: ValueType,
    },
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("no operator `{keyword}` accepts {signature}")]
    UnknownOperator { keyword: String, signature: String },
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("unknown species `{0}`")]
    UnknownSpecies(String),
    #[error("agent {agent} is not of species `{species}`")]
    WrongSpecies { agent: String, species: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("expected {expected} initial value maps, found {found}")]
    InitialValuesMismatch { expected: usize, found: usize },
    #[error("topology update failed: {0}")]
    Topology(String),
    #[error("{0}")]
    Custom(String),
}

impl From<IndexError> for EvalError {
    fn from(err: IndexError) -> Self {
        Self::Topology(err.to_string())
    }
}

impl From<RegistryError> for EvalError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NoHandler { keyword, signature } => {
                Self::UnknownOperator { keyword, signature }
            }
            other => Self::Custom(other.to_string()),
        }
    }
}

/// Snapshot of the scope an evaluation error happened in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScopeContext {
    pub purpose: String,
    pub agents: Vec<String>,
}

impl fmt::Display for ScopeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.purpose, self.agents.join(" > "))
    }
}

/// Evaluation error paired with the scope that raised it.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{error} (in {context})")]
pub struct RuntimeError {
    pub error: EvalError,
    pub context: ScopeContext,
}

impl RuntimeError {
    #[must_use]
    pub fn new(error: EvalError, context: ScopeContext) -> Self {
        Self { error, context }
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Failures of a model loader collaborator.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model `{}` not found", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read model `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model `{}`: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// Fatal problems detected before a job runs its first step.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("initialisation failed: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("the until condition must be a bool expression, found {0}")]
    NonBooleanCondition(ValueType),
    #[error("parameter `{0}` does not name a variable of the model")]
    UnresolvedParameter(String),
    #[error("parameter `{name}` expects {expected}, found {found}")]
    ParameterType {
        name: String,
        expected: ValueType,
        found: ValueType,
    },
    #[error("model has no experiment named `{0}`")]
    UnknownExperiment(String),
    #[error("output `{0}` is neither declared by the experiment nor a world variable")]
    UnknownOutput(String),
    #[error("output `{output}` has invalid frame rate {rate}")]
    InvalidFrameRate { output: String, rate: u32 },
    #[error("no model has been loaded for this job")]
    NotLoaded,
    #[error("the simulation has already been set up")]
    AlreadySetUp,
    #[error("the job has been disposed")]
    Disposed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_mentions_scope() {
        let err = RuntimeError::new(
            EvalError::AgentUnavailable("ant3".into()),
            ScopeContext {
                purpose: "step".into(),
                agents: vec!["world0".into(), "ant1".into()],
            },
        );
        assert_eq!(
            err.to_string(),
            "agent ant3 is no longer available (in step [world0 > ant1])"
        );
    }

    #[test]
    fn registry_miss_maps_to_unknown_operator() {
        let err: EvalError = RegistryError::NoHandler {
            keyword: "+".into(),
            signature: "(bool, agent)".into(),
        }
        .into();
        assert!(matches!(err, EvalError::UnknownOperator { .. }));
    }
}
