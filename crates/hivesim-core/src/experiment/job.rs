use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::output::{
    DisplaySettings, ImageRef, ListenedVariable, Output, OutputSource, ResolvedOutput, Sample,
    inline_image, render_display,
};
use super::parameter::Parameter;
use super::record::JobRecord;
use super::sink::{ImageWriter, OutputSink};
use crate::config::HeadlessConfig;
use crate::error::{CompileError, RuntimeError, SetupError};
use crate::expr::{CompiledExpr, Expr};
use crate::model::{ExperimentDecl, Model, OutputDecl, RuntimeContext};
use crate::registry::Registry;
use crate::simulation::Simulation;
use crate::value::{Value, ValueType};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(0);

fn next_job_id() -> u64 {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

/// Cooperative cancellation flag, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Why `run` stopped stepping.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    FinalStep,
    Condition,
    Interrupted,
    Failed(RuntimeError),
}

/// Outcome of one `run` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub job_id: u64,
    pub seed: u64,
    /// Steps executed by this call.
    pub steps: u64,
    /// Step counter of the simulation when the run stopped.
    pub cycle: u64,
    pub stop: StopReason,
    pub progress_marks: u64,
    pub elapsed: Duration,
}

impl RunReport {
    #[must_use]
    pub fn failed(&self) -> bool {
        matches!(self.stop, StopReason::Failed(_))
    }
}

/// A configured, runnable experiment: model path, parameters, outputs and a
/// stop condition, plus the simulation once loaded.
pub struct ExperimentJob {
    id: u64,
    source_path: PathBuf,
    experiment_name: String,
    final_step: i64,
    seed: u64,
    parameters: Vec<Parameter>,
    outputs: Vec<Output>,
    next_output_id: usize,
    until: Option<Expr>,
    headless: HeadlessConfig,
    simulation: Option<Simulation>,
    condition: Option<CompiledExpr>,
    resolved: Vec<ResolvedOutput>,
    sink: Option<Box<dyn OutputSink + Send>>,
    images: Option<Box<dyn ImageWriter + Send>>,
    interrupt: InterruptHandle,
    header_written: bool,
    disposed: bool,
}

impl std::fmt::Debug for ExperimentJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentJob")
            .field("id", &self.id)
            .field("source_path", &self.source_path)
            .field("experiment_name", &self.experiment_name)
            .field("final_step", &self.final_step)
            .field("seed", &self.seed)
            .field("parameters", &self.parameters)
            .field("outputs", &self.outputs)
            .field("loaded", &self.simulation.is_some())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl Clone for ExperimentJob {
    /// Copies the configuration under a fresh id. The clone has no
    /// simulation, sink or image writer of its own.
    fn clone(&self) -> Self {
        Self {
            id: next_job_id(),
            source_path: self.source_path.clone(),
            experiment_name: self.experiment_name.clone(),
            final_step: self.final_step,
            seed: self.seed,
            parameters: self.parameters.clone(),
            outputs: self.outputs.clone(),
            next_output_id: self.next_output_id,
            until: self.until.clone(),
            headless: self.headless.clone(),
            simulation: None,
            condition: None,
            resolved: Vec::new(),
            sink: None,
            images: None,
            interrupt: InterruptHandle::new(),
            header_written: false,
            disposed: false,
        }
    }
}

impl ExperimentJob {
    #[must_use]
    pub fn new(
        source_path: impl Into<PathBuf>,
        experiment_name: impl Into<String>,
        final_step: i64,
        seed: u64,
    ) -> Self {
        Self {
            id: next_job_id(),
            source_path: source_path.into(),
            experiment_name: experiment_name.into(),
            final_step,
            seed,
            parameters: Vec::new(),
            outputs: Vec::new(),
            next_output_id: 0,
            until: None,
            headless: HeadlessConfig::default(),
            simulation: None,
            condition: None,
            resolved: Vec::new(),
            sink: None,
            images: None,
            interrupt: InterruptHandle::new(),
            header_written: false,
            disposed: false,
        }
    }

    /// Job mirroring an experiment declared by the model: its seed, final
    /// step, parameters and outputs in declaration order.
    pub fn from_declaration(
        source_path: impl Into<PathBuf>,
        model: &Model,
        experiment_name: &str,
    ) -> Result<Self, SetupError> {
        let decl = model
            .experiment(experiment_name)
            .ok_or_else(|| SetupError::UnknownExperiment(experiment_name.to_string()))?;
        let mut job = Self::new(
            source_path,
            experiment_name,
            decl.final_step.unwrap_or(-1),
            decl.seed.unwrap_or(0),
        );
        job.until = decl.until.clone();
        for parameter in &decl.parameters {
            job.add_parameter(Parameter::from(parameter));
        }
        for output in &decl.outputs {
            job.add_output(output.name(), output.framerate())?;
        }
        Ok(job)
    }

    /// Rebuild a job from its persisted document, keeping its id.
    #[must_use]
    pub fn from_record(record: JobRecord) -> Self {
        NEXT_JOB_ID.fetch_max(record.id + 1, Ordering::Relaxed);
        let next_output_id = record
            .outputs
            .iter()
            .map(|output| output.id + 1)
            .max()
            .unwrap_or(0);
        let mut job = Self::new(
            record.source_path,
            record.experiment_name,
            record.final_step,
            record.seed,
        );
        job.id = record.id;
        job.parameters = record.parameters;
        job.outputs = record.outputs;
        job.next_output_id = next_output_id;
        job.until = record.until;
        job
    }

    #[must_use]
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            source_path: self.source_path.clone(),
            final_step: self.final_step,
            seed: self.seed,
            experiment_name: self.experiment_name.clone(),
            parameters: self.parameters.clone(),
            outputs: self.outputs.clone(),
            until: self.until.clone(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    #[must_use]
    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    #[must_use]
    pub fn final_step(&self) -> i64 {
        self.final_step
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    #[must_use]
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    #[must_use]
    pub fn simulation(&self) -> Option<&Simulation> {
        self.simulation.as_ref()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    pub fn set_final_step(&mut self, final_step: i64) {
        self.final_step = final_step;
    }

    /// Stop condition evaluated in the world frame before every step.
    pub fn set_until(&mut self, until: Option<Expr>) {
        self.until = until;
    }

    pub fn set_headless(&mut self, headless: HeadlessConfig) {
        self.headless = headless;
    }

    pub fn set_sink(&mut self, sink: Box<dyn OutputSink + Send>) {
        self.sink = Some(sink);
    }

    pub fn set_image_writer(&mut self, writer: Box<dyn ImageWriter + Send>) {
        self.images = Some(writer);
    }

    pub fn add_parameter(&mut self, parameter: Parameter) {
        match self
            .parameters
            .iter_mut()
            .find(|existing| existing.name == parameter.name)
        {
            Some(existing) => *existing = parameter,
            None => self.parameters.push(parameter),
        }
    }

    /// Change the value of an existing parameter.
    pub fn set_parameter_value(&mut self, name: &str, value: Value) -> Result<(), SetupError> {
        let parameter = self
            .parameters
            .iter_mut()
            .find(|parameter| parameter.name == name)
            .ok_or_else(|| SetupError::UnresolvedParameter(name.to_string()))?;
        if parameter.ty != ValueType::Any {
            let found = value.value_type();
            parameter.value = value.coerce(parameter.ty).ok_or(SetupError::ParameterType {
                name: name.to_string(),
                expected: parameter.ty,
                found,
            })?;
        } else {
            parameter.value = value;
        }
        Ok(())
    }

    /// Append an output and return its id.
    pub fn add_output(&mut self, name: &str, framerate: u32) -> Result<usize, SetupError> {
        if framerate == 0 {
            return Err(SetupError::InvalidFrameRate {
                output: name.to_string(),
                rate: framerate,
            });
        }
        let id = self.next_output_id;
        self.next_output_id += 1;
        self.outputs.push(Output {
            id,
            name: name.to_string(),
            framerate,
        });
        Ok(id)
    }

    pub fn remove_output(&mut self, name: &str) -> bool {
        let before = self.outputs.len();
        self.outputs.retain(|output| output.name != name);
        self.resolved.retain(|resolved| resolved.template.name != name);
        before != self.outputs.len()
    }

    pub fn set_output_framerate(&mut self, name: &str, framerate: u32) -> Result<(), SetupError> {
        if framerate == 0 {
            return Err(SetupError::InvalidFrameRate {
                output: name.to_string(),
                rate: framerate,
            });
        }
        let output = self
            .outputs
            .iter_mut()
            .find(|output| output.name == name)
            .ok_or_else(|| SetupError::UnknownOutput(name.to_string()))?;
        output.framerate = framerate;
        for resolved in &mut self.resolved {
            if resolved.template.name == name {
                resolved.template.framerate = framerate;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|output| output.name.as_str()).collect()
    }

    fn ensure_open(&self) -> Result<(), SetupError> {
        if self.disposed {
            Err(SetupError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Compile the model at `source_path` and build its simulation. The stop
    /// condition and every output are resolved here.
    pub fn load(&mut self, context: &RuntimeContext) -> Result<(), SetupError> {
        self.ensure_open()?;
        self.headless.validate()?;
        let model = context.model(&self.source_path)?;
        let decl = if self.experiment_name.is_empty() {
            None
        } else {
            Some(
                model
                    .experiment(&self.experiment_name)
                    .ok_or_else(|| SetupError::UnknownExperiment(self.experiment_name.clone()))?,
            )
        };
        let registry = context.registry();

        let until = self
            .until
            .clone()
            .or_else(|| decl.and_then(|decl| decl.until.clone()));
        let condition = match until {
            Some(expr) => {
                let compiled = model.compile_world_expression(registry, &expr)?;
                if compiled.value_type() != ValueType::Bool {
                    return Err(SetupError::NonBooleanCondition(compiled.value_type()));
                }
                Some(compiled)
            }
            None => None,
        };

        let mut resolved = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            let source = resolve_output(&model, registry, decl, &output.name)?;
            resolved.push(ResolvedOutput {
                template: output.clone(),
                source,
                last: Sample::Unavailable,
            });
        }

        let simulation = Simulation::new(
            Arc::clone(&model),
            Arc::clone(registry),
            context.config().clone(),
        )?;
        if let Some(mut previous) = self.simulation.replace(simulation) {
            previous.dispose();
        }
        self.condition = condition;
        self.resolved = resolved;
        debug!(job = self.id, model = %model.name(), outputs = self.resolved.len(), "job loaded");
        Ok(())
    }

    /// Apply every parameter to its world variable.
    pub fn bind_parameters(&mut self) -> Result<(), SetupError> {
        self.ensure_open()?;
        let simulation = self.simulation.as_mut().ok_or(SetupError::NotLoaded)?;
        for parameter in &self.parameters {
            simulation.set_parameter(parameter.target(), parameter.value.clone())?;
        }
        Ok(())
    }

    /// Seed the simulation, create the world and announce the job to the sink.
    pub fn setup(&mut self) -> Result<(), SetupError> {
        self.ensure_open()?;
        let simulation = self.simulation.as_mut().ok_or(SetupError::NotLoaded)?;
        simulation.setup(&self.experiment_name, self.seed)?;
        if !self.header_written {
            self.header_written = true;
            let record = self.to_record();
            if let Some(sink) = self.sink.as_mut()
                && let Err(err) = sink.write_header(&record)
            {
                warn!(job = self.id, error = %err, "failed to write output header");
            }
        }
        info!(
            job = self.id,
            experiment = %self.experiment_name,
            seed = self.seed,
            final_step = self.final_step,
            "experiment set up"
        );
        Ok(())
    }

    /// Load, bind parameters and set up in one go.
    pub fn load_and_build(&mut self, context: &RuntimeContext) -> Result<(), SetupError> {
        self.load(context)?;
        self.bind_parameters()?;
        self.setup()
    }

    /// Advance one step, sample the outputs for it and hand them to the
    /// sink. Returns the new step count.
    pub fn step(&mut self) -> Result<u64, SetupError> {
        self.ensure_open()?;
        let simulation = self.simulation.as_mut().ok_or(SetupError::NotLoaded)?;
        if !simulation.is_set_up() {
            return Err(SetupError::NotLoaded);
        }
        let count = simulation.step()?;
        let step = count - 1;
        self.sample(step)?;
        if let Some(sink) = self.sink.as_mut() {
            let batch: Vec<ListenedVariable> =
                self.resolved.iter().map(ResolvedOutput::listened).collect();
            if let Err(err) = sink.write_step(step, &batch) {
                warn!(job = self.id, step, error = %err, "failed to write step outputs");
            }
        }
        Ok(count)
    }

    fn sample(&mut self, step: u64) -> Result<(), RuntimeError> {
        let Self {
            id,
            seed,
            experiment_name,
            headless,
            simulation,
            resolved,
            images,
            ..
        } = self;
        let Some(simulation) = simulation.as_mut() else {
            return Ok(());
        };
        for output in resolved.iter_mut() {
            if !output.template.samples_at(step) {
                output.last = Sample::Unavailable;
                continue;
            }
            output.last = match &output.source {
                OutputSource::Monitor(expr) => Sample::Value(simulation.evaluate_in_world(expr)?),
                OutputSource::World(name) => match simulation.world_variable(name) {
                    Ok(value) => Sample::Value(value),
                    Err(error) => {
                        return Err(RuntimeError::new(error, Default::default()));
                    }
                },
                OutputSource::Seed => Sample::Value(Value::Int(*seed as i64)),
                OutputSource::ExperimentName => {
                    Sample::Value(Value::String(experiment_name.clone()))
                }
                OutputSource::Display(settings) => {
                    let raster = render_display(simulation, settings);
                    match images.as_mut() {
                        Some(writer) => {
                            let name = &output.template.name;
                            let path = settings.image_path(name, *id, &headless.images_dir, step);
                            match writer.write_image(&path, &raster) {
                                Ok(()) => Sample::Image(ImageRef {
                                    name: name.clone(),
                                    path,
                                }),
                                Err(err) => {
                                    warn!(
                                        job = *id,
                                        output = %name,
                                        error = %err,
                                        "failed to write display image"
                                    );
                                    Sample::Unavailable
                                }
                            }
                        }
                        None => inline_image(raster),
                    }
                }
            };
        }
        Ok(())
    }

    /// Step while the final step is not reached, the stop condition is
    /// false and nobody interrupted the job. A failing step stops the run
    /// and disposes the job.
    pub fn run(&mut self) -> Result<RunReport, SetupError> {
        self.ensure_open()?;
        let started = Instant::now();
        let interval = self.headless.progress_interval(self.final_step);
        let mut steps = 0;
        let mut progress_marks = 0;
        let stop = loop {
            if self.interrupt.is_interrupted() {
                break StopReason::Interrupted;
            }
            let simulation = self.simulation.as_mut().ok_or(SetupError::NotLoaded)?;
            if self.final_step >= 0 && simulation.cycle() >= self.final_step as u64 {
                break StopReason::FinalStep;
            }
            if let Some(condition) = &self.condition {
                match simulation.evaluate_in_world(condition) {
                    Ok(value) if value.as_bool() => break StopReason::Condition,
                    Ok(_) => {}
                    Err(err) => break StopReason::Failed(err),
                }
            }
            match self.step() {
                Ok(count) => {
                    steps += 1;
                    if count % interval == 0 {
                        progress_marks += 1;
                        if self.headless.show_progress {
                            print!(".");
                            let _ = std::io::stdout().flush();
                        }
                    }
                }
                Err(SetupError::Runtime(err)) => break StopReason::Failed(err),
                Err(other) => return Err(other),
            }
        };
        if self.headless.show_progress && progress_marks > 0 {
            println!();
        }
        let cycle = self.simulation.as_ref().map_or(0, Simulation::cycle);
        let report = RunReport {
            job_id: self.id,
            seed: self.seed,
            steps,
            cycle,
            stop,
            progress_marks,
            elapsed: started.elapsed(),
        };
        match &report.stop {
            StopReason::Failed(err) => {
                error!(job = self.id, cycle, error = %err, "experiment failed");
                self.dispose();
            }
            stop => info!(job = self.id, steps, cycle, ?stop, "experiment stopped"),
        }
        Ok(report)
    }

    /// Load, run and dispose, whatever happens on the way.
    pub fn play_and_dispose(&mut self, context: &RuntimeContext) -> Result<RunReport, SetupError> {
        let started = Instant::now();
        let outcome = self.load_and_build(context).and_then(|()| self.run());
        self.dispose();
        info!(
            job = self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "experiment played"
        );
        outcome
    }

    /// Release the simulation and close the sink. Only the first call has
    /// any effect.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(mut simulation) = self.simulation.take() {
            simulation.dispose();
        }
        self.condition = None;
        self.resolved.clear();
        if let Some(mut sink) = self.sink.take()
            && let Err(err) = sink.close()
        {
            warn!(job = self.id, error = %err, "failed to close output sink");
        }
        debug!(job = self.id, "experiment disposed");
    }
}

impl Drop for ExperimentJob {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn resolve_output(
    model: &Model,
    registry: &Registry,
    decl: Option<&ExperimentDecl>,
    name: &str,
) -> Result<OutputSource, SetupError> {
    if let Some(declared) = decl.and_then(|decl| decl.output(name)) {
        return Ok(match declared {
            OutputDecl::Monitor { value, .. } => {
                OutputSource::Monitor(model.compile_world_expression(registry, value)?)
            }
            OutputDecl::Display {
                width,
                height,
                species,
                output_path,
                ..
            } => {
                let species = species
                    .iter()
                    .map(|species| {
                        model
                            .species_named(species)
                            .map(|species| species.id())
                            .ok_or_else(|| {
                                SetupError::Compile(CompileError::UnknownSpecies(
                                    species.clone(),
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                OutputSource::Display(DisplaySettings {
                    width: *width,
                    height: *height,
                    species,
                    output_path: output_path.clone(),
                })
            }
        });
    }
    if model.world_species().variable(name).is_some() || name == "name" || name == "location" {
        return Ok(OutputSource::World(name.to_string()));
    }
    match name {
        "seed" => Ok(OutputSource::Seed),
        "experiment_name" => Ok(OutputSource::ExperimentName),
        _ => Err(SetupError::UnknownOutput(name.to_string())),
    }
}
