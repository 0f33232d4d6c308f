use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::output::Output;
use super::parameter::Parameter;
use crate::expr::Expr;

/// Persisted shape of an experiment job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub source_path: PathBuf,
    pub final_step: i64,
    pub seed: u64,
    pub experiment_name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<Expr>,
}

/// Batch of jobs run one after the other.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub jobs: Vec<JobRecord>,
}
