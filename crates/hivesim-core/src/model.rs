//! Model descriptors, compiled models and the runtime context that caches them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use hivesim_index::{Bounds, Coord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::error::{CompileError, LoadError, SetupError};
use crate::expr::{CompileContext, CompiledExpr, Expr};
use crate::geometry::Point;
use crate::registry::Registry;
use crate::species::{Species, SpeciesDecl, SpeciesId, compile_species};
use crate::builtins::WORLD_SPECIES;
use crate::value::{Value, ValueType};

fn default_framerate() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDecl {
    pub width: f64,
    pub height: f64,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub torus: Option<bool>,
}

impl Default for EnvironmentDecl {
    fn default() -> Self {
        Self {
            width: 100.0,
            height: 100.0,
            torus: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDecl {
    pub name: String,
    /// Target variable of the world; defaults to `name`.
    #[serde(default)]
    pub var: Option<String>,
    #[serde(rename = "type", default)]
    pub ty: ValueType,
    pub value: Value,
}

/// Output declared by an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OutputDecl {
    /// Expression evaluated in the world frame.
    Monitor {
        name: String,
        value: Expr,
        #[serde(default = "default_framerate")]
        framerate: u32,
    },
    /// Occupancy raster of some populations, exported as an image.
    Display {
        name: String,
        width: u32,
        height: u32,
        #[serde(default)]
        species: Vec<String>,
        #[serde(default = "default_framerate")]
        framerate: u32,
        #[serde(default)]
        output_path: Option<PathBuf>,
    },
}

impl OutputDecl {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Monitor { name, .. } | Self::Display { name, .. } => name,
        }
    }

    #[must_use]
    pub fn framerate(&self) -> u32 {
        match self {
            Self::Monitor { framerate, .. } | Self::Display { framerate, .. } => *framerate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDecl {
    pub name: String,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub until: Option<Expr>,
    #[serde(default)]
    pub final_step: Option<i64>,
    #[serde(default)]
    pub parameters: Vec<ParameterDecl>,
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
}

impl ExperimentDecl {
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&OutputDecl> {
        self.outputs.iter().find(|output| output.name() == name)
    }
}

/// Parsed model, as produced by a [`ModelLoader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(default)]
    pub environment: EnvironmentDecl,
    #[serde(default)]
    pub global: SpeciesDecl,
    #[serde(default)]
    pub species: Vec<SpeciesDecl>,
    #[serde(default)]
    pub experiments: Vec<ExperimentDecl>,
}

/// Extent of the world, fixed when the world agent is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    pub bounds: Bounds,
    pub torus: bool,
}

impl Environment {
    #[must_use]
    pub fn new(width: f64, height: f64, torus: bool) -> Self {
        Self {
            bounds: Bounds::from_size(width, height),
            torus,
        }
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.bounds.width()
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.bounds.height()
    }

    #[must_use]
    pub fn center(&self) -> Point {
        self.bounds.center().into()
    }

    /// Wrap on a torus, clamp into the bounds otherwise.
    #[must_use]
    pub fn normalize(&self, point: Point) -> Point {
        let b = &self.bounds;
        if self.torus {
            Point::new(
                b.min_x + (point.x - b.min_x).rem_euclid(b.width()),
                b.min_y + (point.y - b.min_y).rem_euclid(b.height()),
            )
        } else {
            Point::new(point.x.clamp(b.min_x, b.max_x), point.y.clamp(b.min_y, b.max_y))
        }
    }

    #[must_use]
    pub fn distance(&self, a: Point, b: Point) -> f64 {
        let mut dx = (a.x - b.x).abs();
        let mut dy = (a.y - b.y).abs();
        if self.torus {
            dx = dx.rem_euclid(self.width());
            dy = dy.rem_euclid(self.height());
            dx = dx.min(self.width() - dx);
            dy = dy.min(self.height() - dy);
        }
        dx.hypot(dy)
    }

    #[must_use]
    pub fn contains(&self, point: Point) -> bool {
        self.bounds.contains(Coord::from(point))
    }
}

/// Compiled model shared by every simulation built from it.
#[derive(Debug)]
pub struct Model {
    name: String,
    environment: EnvironmentDecl,
    species: Vec<Species>,
    names: HashMap<String, SpeciesId>,
    experiments: Vec<ExperimentDecl>,
}

impl Model {
    pub fn compile(descriptor: &ModelDescriptor, registry: &Registry) -> Result<Self, CompileError> {
        let world_name = if descriptor.global.name.is_empty() {
            WORLD_SPECIES
        } else {
            descriptor.global.name.as_str()
        };
        let species = compile_species(world_name, &descriptor.global, &descriptor.species, registry)?;
        let names = species
            .iter()
            .map(|species| (species.name().to_string(), species.id()))
            .collect();
        debug!(model = %descriptor.name, species = species.len(), "model compiled");
        Ok(Self {
            name: descriptor.name.clone(),
            environment: descriptor.environment,
            species,
            names,
            experiments: descriptor.experiments.clone(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn environment(&self) -> &EnvironmentDecl {
        &self.environment
    }

    #[must_use]
    pub fn world_species(&self) -> &Species {
        &self.species[SpeciesId::WORLD.0]
    }

    #[must_use]
    pub fn species(&self, id: SpeciesId) -> &Species {
        &self.species[id.0]
    }

    #[must_use]
    pub fn species_named(&self, name: &str) -> Option<&Species> {
        self.names.get(name).map(|id| &self.species[id.0])
    }

    #[must_use]
    pub fn all_species(&self) -> &[Species] {
        &self.species
    }

    #[must_use]
    pub fn experiments(&self) -> &[ExperimentDecl] {
        &self.experiments
    }

    #[must_use]
    pub fn experiment(&self, name: &str) -> Option<&ExperimentDecl> {
        self.experiments.iter().find(|experiment| experiment.name == name)
    }

    /// Whether `species` is `ancestor` or inherits from it.
    #[must_use]
    pub fn is_kind_of(&self, species: SpeciesId, ancestor: SpeciesId) -> bool {
        let mut cursor = Some(species);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.species[id.0].parent();
        }
        false
    }

    /// Compile an expression evaluated with the world agent as `self`.
    pub fn compile_world_expression(
        &self,
        registry: &Registry,
        expr: &Expr,
    ) -> Result<CompiledExpr, CompileError> {
        expr.compile(&CompileContext::new(registry, &self.species, SpeciesId::WORLD))
    }
}

/// Resolves a source path into a parsed model.
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<ModelDescriptor, LoadError>;
}

/// Shared services for experiment jobs: the frozen registry, the model
/// loader, simulation configuration and a cache of compiled models.
pub struct RuntimeContext {
    registry: Arc<Registry>,
    loader: Box<dyn ModelLoader>,
    config: SimulationConfig,
    models: Mutex<HashMap<PathBuf, Arc<Model>>>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    pub fn new(
        registry: Arc<Registry>,
        loader: Box<dyn ModelLoader>,
        config: SimulationConfig,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        Ok(Self {
            registry,
            loader,
            config,
            models: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Load and compile the model at `path`, reusing earlier compilations.
    pub fn model(&self, path: &Path) -> Result<Arc<Model>, SetupError> {
        if let Some(model) = self
            .models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return Ok(Arc::clone(model));
        }
        let descriptor = self.loader.load(path)?;
        let model = Arc::new(Model::compile(&descriptor, &self.registry)?);
        info!(path = %path.display(), model = %model.name(), "model loaded");
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), Arc::clone(&model));
        Ok(model)
    }
}

/// Loader serving descriptors registered in memory, keyed by path.
#[derive(Debug, Default, Clone)]
pub struct StaticLoader {
    models: HashMap<PathBuf, ModelDescriptor>,
}

impl StaticLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_model(mut self, path: impl Into<PathBuf>, descriptor: ModelDescriptor) -> Self {
        self.models.insert(path.into(), descriptor);
        self
    }
}

impl ModelLoader for StaticLoader {
    fn load(&self, path: &Path) -> Result<ModelDescriptor, LoadError> {
        self.models
            .get(path)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torus_environment_wraps_and_flat_one_clamps() {
        let torus = Environment::new(100.0, 50.0, true);
        assert_eq!(torus.normalize(Point::new(-10.0, 60.0)), Point::new(90.0, 10.0));
        assert!((torus.distance(Point::new(1.0, 1.0), Point::new(99.0, 1.0)) - 2.0).abs() < 1e-9);
        let flat = Environment::new(100.0, 50.0, false);
        assert_eq!(flat.normalize(Point::new(-10.0, 60.0)), Point::new(0.0, 50.0));
        assert_eq!(flat.center(), Point::new(50.0, 25.0));
    }

    #[test]
    fn context_caches_compiled_models() {
        let descriptor: ModelDescriptor =
            serde_json::from_str(r#"{"name": "empty"}"#).expect("descriptor");
        let context = RuntimeContext::new(
            Arc::new(Registry::with_builtins()),
            Box::new(StaticLoader::new().with_model("empty.json", descriptor)),
            SimulationConfig::default(),
        )
        .expect("context");
        let first = context.model(Path::new("empty.json")).expect("model");
        let second = context.model(Path::new("empty.json")).expect("model");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.world_species().name(), "world");
        assert!(matches!(
            context.model(Path::new("missing.json")),
            Err(SetupError::Load(LoadError::NotFound(_)))
        ));
    }
}
