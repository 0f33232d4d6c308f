//! Experiment jobs: parameters, output sampling, sinks and the run loop.

mod job;
mod output;
mod parameter;
mod record;
mod sink;

use rayon::prelude::*;
use tracing::info;

pub use job::{ExperimentJob, InterruptHandle, RunReport, StopReason};
pub use output::{
    DisplaySettings, ImageRef, ListenedVariable, Output, OutputKind, Sample, inline_image,
    render_display,
};
pub use parameter::Parameter;
pub use record::{JobRecord, Plan};
pub use sink::{ImageWriter, MemorySink, OutputSink, SinkError, SinkLog};

use crate::error::SetupError;
use crate::model::RuntimeContext;

/// Run one clone of `template` per seed on the rayon pool. Each clone owns
/// its simulation; `attach` may give it a sink or image writer before it
/// starts. Results come back in seed order.
pub fn run_replications<F>(
    template: &ExperimentJob,
    context: &RuntimeContext,
    seeds: &[u64],
    attach: F,
) -> Vec<(u64, Result<RunReport, SetupError>)>
where
    F: Fn(&mut ExperimentJob),
{
    let jobs: Vec<ExperimentJob> = seeds
        .iter()
        .map(|seed| {
            let mut job = template.clone();
            job.set_seed(*seed);
            attach(&mut job);
            job
        })
        .collect();
    info!(
        replications = jobs.len(),
        threads = rayon::current_num_threads(),
        "running replications"
    );
    jobs.into_par_iter()
        .map(|mut job| {
            let seed = job.seed();
            (seed, job.play_and_dispose(context))
        })
        .collect()
}
