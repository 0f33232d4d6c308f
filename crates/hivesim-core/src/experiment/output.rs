use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::expr::CompiledExpr;
use crate::simulation::Simulation;
use crate::species::SpeciesId;
use crate::value::{Raster, Value};

/// Output template: what to sample and how often. Ids are sequential per
/// job, starting at 0, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub id: usize,
    pub name: String,
    pub framerate: u32,
}

impl Output {
    /// Whether `step` refreshes this output.
    #[must_use]
    pub fn samples_at(&self, step: u64) -> bool {
        self.framerate > 0 && step % u64::from(self.framerate) == 0
    }
}

/// Where an output takes its values from, decided when the model loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Monitor or display declared by the experiment.
    Output,
    /// Variable of the world agent.
    SimulationAttribute,
    /// Attribute of the experiment itself (`seed`, `experiment_name`).
    ExperimentAttribute,
}

/// Image written by an output, referenced instead of carried inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub path: PathBuf,
}

/// Value of an output for one step.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Sample {
    /// Not refreshed this step.
    #[default]
    Unavailable,
    Value(Value),
    Image(ImageRef),
}

impl Sample {
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }

    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// One output's sample as handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenedVariable {
    pub name: String,
    pub kind: OutputKind,
    pub sample: Sample,
}

/// Display parameters of a raster output.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
    pub species: Vec<SpeciesId>,
    pub output_path: Option<PathBuf>,
}

impl DisplaySettings {
    /// File receiving the snapshot of `step`.
    #[must_use]
    pub fn image_path(&self, name: &str, job_id: u64, images_dir: &Path, step: u64) -> PathBuf {
        match &self.output_path {
            Some(base) => {
                let mut path = base.clone().into_os_string();
                path.push(format!("-{step}.png"));
                PathBuf::from(path)
            }
            None => images_dir.join(format!("{name}{job_id}-{step}.png")),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum OutputSource {
    Monitor(CompiledExpr),
    Display(DisplaySettings),
    World(String),
    Seed,
    ExperimentName,
}

impl OutputSource {
    pub(crate) fn kind(&self) -> OutputKind {
        match self {
            Self::Monitor(_) | Self::Display(_) => OutputKind::Output,
            Self::World(_) => OutputKind::SimulationAttribute,
            Self::Seed | Self::ExperimentName => OutputKind::ExperimentAttribute,
        }
    }
}

/// Output bound to its source for one loaded simulation.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOutput {
    pub(crate) template: Output,
    pub(crate) source: OutputSource,
    pub(crate) last: Sample,
}

impl ResolvedOutput {
    pub(crate) fn listened(&self) -> ListenedVariable {
        ListenedVariable {
            name: self.template.name.clone(),
            kind: self.source.kind(),
            sample: self.last.clone(),
        }
    }
}

/// Occupancy raster of the environment: each active agent of the listed
/// species (all species when empty) is drawn as a disc of its footprint.
#[must_use]
pub fn render_display(sim: &Simulation, settings: &DisplaySettings) -> Raster {
    let config = sim.config();
    let mut raster = Raster::filled(settings.width, settings.height, config.display_background);
    if settings.width == 0 || settings.height == 0 {
        return raster;
    }
    let bounds = sim.environment().bounds;
    let scale_x = f64::from(settings.width) / bounds.width();
    let scale_y = f64::from(settings.height) / bounds.height();
    for (id, agent) in sim.active_agents() {
        if !settings.species.is_empty()
            && !settings
                .species
                .iter()
                .any(|species| sim.is_kind_of(id, *species).unwrap_or(false))
        {
            continue;
        }
        let location = agent.location();
        let cx = (location.x - bounds.min_x) * scale_x;
        let cy = (location.y - bounds.min_y) * scale_y;
        let radius = agent.shape().footprint_radius();
        let rx = (radius * scale_x).max(0.5);
        let ry = (radius * scale_y).max(0.5);
        let x0 = (cx - rx).floor().max(0.0) as u32;
        let y0 = (cy - ry).floor().max(0.0) as u32;
        let x1 = ((cx + rx).ceil() as u32).min(settings.width);
        let y1 = ((cy + ry).ceil() as u32).min(settings.height);
        for y in y0..y1 {
            for x in x0..x1 {
                let dx = (f64::from(x) + 0.5 - cx) / rx;
                let dy = (f64::from(y) + 0.5 - cy) / ry;
                if dx * dx + dy * dy <= 1.0 {
                    raster.put(x, y, config.display_color);
                }
            }
        }
    }
    raster
}

/// Raster wrapped as a value for runs without an image writer.
#[must_use]
pub fn inline_image(raster: Raster) -> Sample {
    Sample::Value(Value::Image(Arc::new(raster)))
}
