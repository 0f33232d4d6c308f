//! Execution core of the hivesim agent-based modeling platform: the
//! extension registry, compiled expressions and statements, evaluation
//! scopes, agent populations, the simulation arena and the experiment driver.

pub mod agent;
pub mod builtins;
pub mod config;
pub mod error;
pub mod experiment;
pub mod expr;
pub mod geometry;
pub mod model;
pub mod population;
pub mod registry;
pub mod scope;
pub mod simulation;
pub mod species;
pub mod statement;
pub mod value;

pub use agent::{Agent, AgentId, AgentSlot, Lifecycle};
pub use config::{HeadlessConfig, InitialValuesPolicy, SimulationConfig};
pub use error::{
    CompileError, ConfigError, EvalError, LoadError, RegistryError, RuntimeError, ScopeContext,
    SetupError,
};
pub use experiment::{
    ExperimentJob, ImageRef, ImageWriter, InterruptHandle, JobRecord, ListenedVariable,
    MemorySink, Output, OutputKind, OutputSink, Parameter, Plan, RunReport, Sample, SinkError,
    StopReason, run_replications,
};
pub use expr::{CompiledExpr, Expr};
pub use geometry::{Point, Shape};
pub use model::{
    Environment, EnvironmentDecl, ExperimentDecl, Model, ModelDescriptor, ModelLoader,
    OutputDecl, ParameterDecl, RuntimeContext, StaticLoader,
};
pub use population::{Population, PopulationId};
pub use registry::{Registry, RegistryBuilder};
pub use scope::Scope;
pub use simulation::Simulation;
pub use species::{Species, SpeciesDecl, SpeciesId, TopologyKind};
pub use statement::Statement;
pub use value::{Raster, Value, ValueType};
