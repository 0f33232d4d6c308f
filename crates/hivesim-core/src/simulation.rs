//! Runtime state of one simulation: agent and population arenas, the
//! world agent, stepping and teardown.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use hivesim_index::{Footprint, NeighborhoodIndex, Topology, TopologySettings};
use ordered_float::OrderedFloat;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use slotmap::SlotMap;
use tracing::{debug, info, trace};

use crate::agent::{Agent, AgentId, Lifecycle};
use crate::config::{InitialValuesPolicy, SimulationConfig};
use crate::error::{ConfigError, EvalError, RuntimeError, ScopeContext, SetupError};
use crate::expr::CompiledExpr;
use crate::geometry::{Point, Shape};
use crate::model::{Environment, Model};
use crate::population::{Population, PopulationId};
use crate::registry::Registry;
use crate::scope::{Scope, SimulationLiveness};
use crate::species::{Species, SpeciesId, TopologyKind};
use crate::statement::{Flow, execute_block};
use crate::value::{Value, ValueType};

fn footprint(shape: &Shape) -> Footprint {
    Footprint::new(shape.location().into(), shape.footprint_radius())
}

fn unavailable(agent: AgentId) -> EvalError {
    EvalError::AgentUnavailable(format!("{agent:?}"))
}

/// One running simulation built from a compiled [`Model`].
#[derive(Debug)]
pub struct Simulation {
    model: Arc<Model>,
    registry: Arc<Registry>,
    config: SimulationConfig,
    agents: SlotMap<AgentId, Agent>,
    populations: SlotMap<PopulationId, Population>,
    world_population: PopulationId,
    environment: Environment,
    parameters: BTreeMap<String, Value>,
    rng: SmallRng,
    seed: u64,
    cycle: u64,
    dying: Vec<AgentId>,
    liveness: Arc<SimulationLiveness>,
    experiment_name: String,
    set_up: bool,
    disposed: bool,
}

impl Simulation {
    pub fn new(
        model: Arc<Model>,
        registry: Arc<Registry>,
        config: SimulationConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let declared = *model.environment();
        if !(declared.width > 0.0) || !(declared.height > 0.0) {
            return Err(ConfigError::Invalid("environment must have a positive extent"));
        }
        let environment = Environment::new(
            declared.width,
            declared.height,
            declared.torus.unwrap_or(config.torus),
        );
        let mut populations = SlotMap::with_key();
        let world_population = populations.insert(Population::new(
            SpeciesId::WORLD,
            model.world_species().name(),
            None,
            Topology::amorphous(),
        ));
        Ok(Self {
            model,
            registry,
            config,
            agents: SlotMap::with_key(),
            populations,
            world_population,
            environment,
            parameters: BTreeMap::new(),
            rng: SmallRng::seed_from_u64(0),
            seed: 0,
            cycle: 0,
            dying: Vec::new(),
            liveness: SimulationLiveness::new(),
            experiment_name: String::new(),
            set_up: false,
            disposed: false,
        })
    }

    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of completed steps.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    #[must_use]
    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    #[must_use]
    pub fn is_set_up(&self) -> bool {
        self.set_up
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Scopes opened on this simulation and not yet released.
    #[must_use]
    pub fn open_scopes(&self) -> usize {
        self.liveness.open_scopes()
    }

    #[must_use]
    pub fn world_population(&self) -> PopulationId {
        self.world_population
    }

    #[must_use]
    pub fn world(&self) -> Option<AgentId> {
        self.populations
            .get(self.world_population)
            .and_then(|population| population.members().first().copied())
    }

    #[must_use]
    pub fn population(&self, id: PopulationId) -> Option<&Population> {
        self.populations.get(id)
    }

    /// Number of agents in the arena, dying ones included.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Active agents other than the world, in arena order.
    pub fn active_agents(&self) -> impl Iterator<Item = (AgentId, &Agent)> {
        let world = self.world();
        self.agents
            .iter()
            .filter(move |(id, agent)| agent.is_active() && Some(*id) != world)
    }

    pub fn agent(&self, id: AgentId) -> Result<&Agent, EvalError> {
        self.agents.get(id).ok_or_else(|| unavailable(id))
    }

    /// Lifecycle of `id`. Swept agents have left the arena, so their
    /// handles report `Disposed`.
    #[must_use]
    pub fn lifecycle(&self, id: AgentId) -> Lifecycle {
        self.agents
            .get(id)
            .map_or(Lifecycle::Disposed, Agent::lifecycle)
    }

    #[must_use]
    pub fn is_active(&self, id: AgentId) -> bool {
        self.agents.get(id).is_some_and(Agent::is_active)
    }

    /// Display name of an agent, or its handle once disposed.
    #[must_use]
    pub fn agent_label(&self, id: AgentId) -> String {
        self.agents
            .get(id)
            .map_or_else(|| format!("{id:?}"), |agent| agent.name().to_string())
    }

    pub fn species_of(&self, id: AgentId) -> Result<SpeciesId, EvalError> {
        let agent = self.agent(id)?;
        self.populations
            .get(agent.population())
            .map(Population::species)
            .ok_or_else(|| unavailable(id))
    }

    pub fn is_kind_of(&self, id: AgentId, species: SpeciesId) -> Result<bool, EvalError> {
        Ok(self.model.is_kind_of(self.species_of(id)?, species))
    }

    #[must_use]
    pub fn host_of(&self, id: AgentId) -> Option<AgentId> {
        let agent = self.agents.get(id)?;
        self.populations.get(agent.population())?.host()
    }

    /// Agent `levels` hosts above `id`.
    pub fn ancestor(&self, id: AgentId, levels: usize) -> Result<AgentId, EvalError> {
        let mut cursor = id;
        for _ in 0..levels {
            self.agent(cursor)?;
            cursor = self
                .host_of(cursor)
                .ok_or_else(|| EvalError::AgentUnavailable("host".into()))?;
        }
        Ok(cursor)
    }

    pub(crate) fn open_scope(&mut self, purpose: &str) -> Scope {
        Scope::open(
            purpose,
            SmallRng::from_rng(&mut self.rng),
            Arc::clone(&self.liveness),
        )
    }

    /// Names of the agents on `scope`'s stack, for error reports.
    #[must_use]
    pub fn scope_context(&self, scope: &Scope) -> ScopeContext {
        ScopeContext {
            purpose: scope.purpose().to_string(),
            agents: scope.stack().iter().map(|id| self.agent_label(*id)).collect(),
        }
    }

    fn ensure_alive(&self) -> Result<(), EvalError> {
        if self.disposed {
            Err(EvalError::SimulationDisposed)
        } else {
            Ok(())
        }
    }

    /// Store a world variable value applied when the world is created.
    pub fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), SetupError> {
        if self.disposed {
            return Err(SetupError::Disposed);
        }
        if self.set_up {
            return Err(SetupError::AlreadySetUp);
        }
        let slot = self
            .model
            .world_species()
            .variable(name)
            .ok_or_else(|| SetupError::UnresolvedParameter(name.to_string()))?;
        let found = value.value_type();
        let value = value.coerce(slot.ty).ok_or_else(|| SetupError::ParameterType {
            name: name.to_string(),
            expected: slot.ty,
            found,
        })?;
        self.parameters.insert(name.to_string(), value);
        Ok(())
    }

    /// Seed the random source and create the world agent.
    pub fn setup(&mut self, experiment_name: &str, seed: u64) -> Result<(), SetupError> {
        if self.disposed {
            return Err(SetupError::Disposed);
        }
        if self.set_up {
            return Err(SetupError::AlreadySetUp);
        }
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self.experiment_name = experiment_name.to_string();
        let initial = vec![self.parameters.clone()];
        let mut scope = self.open_scope("init");
        let world_population = self.world_population;
        let created = self
            .create_agents(&mut scope, world_population, 1, &initial, false)
            .map_err(|error| RuntimeError::new(error, self.scope_context(&scope)));
        scope.release();
        created?;
        self.set_up = true;
        info!(
            model = %self.model.name(),
            experiment = %experiment_name,
            seed,
            agents = self.agents.len(),
            "simulation set up"
        );
        Ok(())
    }

    /// Create `count` agents in `population`, in creation order.
    ///
    /// `initial_values` holds one map per agent; shorter sequences cycle
    /// unless the configuration is strict. Restored agents skip initializers
    /// and init blocks. The world population creates its single agent once
    /// and returns it on every later call.
    pub fn create_agents(
        &mut self,
        scope: &mut Scope,
        population: PopulationId,
        count: usize,
        initial_values: &[BTreeMap<String, Value>],
        is_restored: bool,
    ) -> Result<Vec<AgentId>, EvalError> {
        self.ensure_alive()?;
        scope.ensure_usable()?;
        if population == self.world_population {
            return self.create_world(scope, initial_values.first(), is_restored);
        }
        if self.config.initial_values == InitialValuesPolicy::Strict
            && !initial_values.is_empty()
            && initial_values.len() != count
        {
            return Err(EvalError::InitialValuesMismatch {
                expected: count,
                found: initial_values.len(),
            });
        }
        let species_id = self
            .populations
            .get(population)
            .map(Population::species)
            .ok_or_else(|| EvalError::UnknownSpecies(format!("{population:?}")))?;
        let model = Arc::clone(&self.model);
        let species = model.species(species_id);

        let mut created = Vec::with_capacity(count);
        for index in 0..count {
            let values = if initial_values.is_empty() {
                None
            } else {
                Some(&initial_values[index % initial_values.len()])
            };
            let id = self.spawn(scope, population, species, values, is_restored)?;
            created.push(id);
        }
        trace!(species = %species.name(), count, "agents created");
        Ok(created)
    }

    fn spawn(
        &mut self,
        scope: &mut Scope,
        population: PopulationId,
        species: &Species,
        values: Option<&BTreeMap<String, Value>>,
        is_restored: bool,
    ) -> Result<AgentId, EvalError> {
        let pop = self
            .populations
            .get_mut(population)
            .ok_or_else(|| EvalError::UnknownSpecies(species.name().to_string()))?;
        let slot = pop.allocate_slot();
        let name = format!("{}{}", species.name(), slot.index);
        let id = self.agents.insert(Agent::unborn(population, slot, name));

        let location = match values.and_then(|values| values.get("location")) {
            Some(Value::Point(point)) => self.environment.normalize(*point),
            _ => {
                let bounds = self.environment.bounds;
                let rng = scope.rng();
                Point::new(
                    rng.random_range(bounds.min_x..bounds.max_x),
                    rng.random_range(bounds.min_y..bounds.max_y),
                )
            }
        };
        let radius = species.footprint().unwrap_or(self.config.footprint_radius);
        let shape = if radius > 0.0 {
            Shape::Circle {
                center: location,
                radius,
            }
        } else {
            Shape::Point { at: location }
        };
        self.agents[id].shape = shape;
        if let Err(error) = self.populations[population].admit(id, footprint(&shape)) {
            self.agents.remove(id);
            self.populations[population].release_slot(slot);
            return Err(error.into());
        }

        let outcome = self
            .bind_variables(scope, id, species, values, is_restored)
            .and_then(|()| self.create_micro_populations(id, species));
        if let Err(error) = outcome {
            self.discard(id);
            return Err(error);
        }
        self.agents[id].lifecycle = Lifecycle::Active;
        if !is_restored {
            self.run_init(scope, id, species)?;
        }
        Ok(id)
    }

    fn create_world(
        &mut self,
        scope: &mut Scope,
        values: Option<&BTreeMap<String, Value>>,
        is_restored: bool,
    ) -> Result<Vec<AgentId>, EvalError> {
        if let Some(world) = self.world() {
            return Ok(vec![world]);
        }
        let model = Arc::clone(&self.model);
        let species = model.world_species();
        let population = self.world_population;
        let slot = self.populations[population].allocate_slot();
        let name = if model.name().is_empty() {
            species.name().to_string()
        } else {
            model.name().to_string()
        };
        let id = self.agents.insert(Agent::unborn(population, slot, name));
        let shape = Shape::rectangle(
            self.environment.width(),
            self.environment.height(),
            self.environment.center(),
        );
        self.agents[id].shape = shape;

        let settings = TopologySettings::new(self.environment.bounds, false, self.config.cell_size);
        let topology = Topology::continuous(settings)?;
        let world_population = &mut self.populations[population];
        world_population.replace_topology(topology);
        world_population.admit(id, footprint(&shape))?;

        self.bind_variables(scope, id, species, values, is_restored)?;
        self.sync_world_counters(id);
        self.create_micro_populations(id, species)?;
        self.agents[id].lifecycle = Lifecycle::Active;
        debug!(world = %self.agents[id].name(), "world agent created");
        if !is_restored {
            self.run_init(scope, id, species)?;
        }
        Ok(vec![id])
    }

    fn sync_world_counters(&mut self, world: AgentId) {
        let cycle = Value::Int(self.cycle as i64);
        let seed = Value::Int(self.seed as i64);
        let species = self.model.world_species();
        let has_cycle = species.variable("cycle").is_some();
        let has_seed = species.variable("seed").is_some();
        if let Some(agent) = self.agents.get_mut(world) {
            if has_cycle {
                agent.variables.insert("cycle".into(), cycle);
            }
            if has_seed {
                agent.variables.insert("seed".into(), seed);
            }
        }
    }

    fn bind_variables(
        &mut self,
        scope: &mut Scope,
        id: AgentId,
        species: &Species,
        values: Option<&BTreeMap<String, Value>>,
        is_restored: bool,
    ) -> Result<(), EvalError> {
        for slot in species.variables() {
            if slot.name != "location" && slot.name != "name" {
                self.agents[id]
                    .variables
                    .insert(slot.name.clone(), slot.default.clone());
            }
        }
        if let Some(values) = values {
            for (name, value) in values {
                if name != "location" {
                    self.assign(id, species, name, value.clone())?;
                }
            }
        }
        if is_restored {
            return Ok(());
        }
        for (name, expr) in species.initializers() {
            if values.is_some_and(|values| values.contains_key(name)) {
                continue;
            }
            scope.push(id);
            let value = expr.evaluate(self, scope);
            scope.pop();
            self.assign(id, species, name, value?)?;
        }
        Ok(())
    }

    fn assign(&mut self, id: AgentId, species: &Species, name: &str, value: Value) -> Result<(), EvalError> {
        match name {
            "location" => {
                let point = value.as_point().ok_or(EvalError::TypeMismatch {
                    expected: ValueType::Point,
                    found: value.value_type(),
                })?;
                return self.set_location(id, point);
            }
            "name" => {
                let agent = self.agents.get_mut(id).ok_or_else(|| unavailable(id))?;
                agent.name = value.to_string();
                return Ok(());
            }
            _ => {}
        }
        let slot = species
            .variable(name)
            .ok_or_else(|| EvalError::UnknownVariable(name.to_string()))?;
        let found = value.value_type();
        let value = value.coerce(slot.ty).ok_or(EvalError::TypeMismatch {
            expected: slot.ty,
            found,
        })?;
        let agent = self.agents.get_mut(id).ok_or_else(|| unavailable(id))?;
        agent.variables.insert(name.to_string(), value);
        Ok(())
    }

    fn create_micro_populations(&mut self, host: AgentId, species: &Species) -> Result<(), EvalError> {
        for micro in species.micro_species() {
            self.add_population(host, *micro)?;
        }
        Ok(())
    }

    fn add_population(&mut self, host: AgentId, species: SpeciesId) -> Result<PopulationId, EvalError> {
        let micro = self.model.species(species);
        let topology = match micro.topology() {
            TopologyKind::Continuous => Topology::continuous(TopologySettings::new(
                self.environment.bounds,
                self.environment.torus,
                self.config.cell_size,
            ))?,
            TopologyKind::Amorphous => Topology::amorphous(),
        };
        let id = self
            .populations
            .insert(Population::new(species, micro.name(), Some(host), topology));
        self.agents
            .get_mut(host)
            .ok_or_else(|| unavailable(host))?
            .micro_populations
            .push(id);
        Ok(id)
    }

    fn run_init(&mut self, scope: &mut Scope, id: AgentId, species: &Species) -> Result<(), EvalError> {
        if species.init().is_empty() {
            return Ok(());
        }
        scope.push(id);
        let outcome = execute_block(species.init(), self, scope);
        scope.pop();
        outcome.map(|_| ())
    }

    /// Remove a half-built agent immediately.
    fn discard(&mut self, id: AgentId) {
        if let Some(agent) = self.agents.remove(id) {
            if let Some(population) = self.populations.get_mut(agent.population) {
                population.evict(id, agent.slot);
            }
            for micro in agent.micro_populations {
                self.populations.remove(micro);
            }
        }
    }

    /// Population of `name` hosted by the world, creating built-in
    /// species populations on first request.
    pub fn population_for(&mut self, name: &str) -> Result<PopulationId, EvalError> {
        self.ensure_alive()?;
        if let Some(existing) = self.population_named(name) {
            return Ok(existing);
        }
        let world = self
            .world()
            .ok_or_else(|| EvalError::AgentUnavailable("world".into()))?;
        let species = self
            .model
            .species_named(name)
            .filter(|species| species.is_builtin() && self.registry.is_builtin_species(name))
            .map(Species::id)
            .ok_or_else(|| EvalError::UnknownSpecies(name.to_string()))?;
        let id = self.add_population(world, species)?;
        debug!(species = %name, "built-in population created");
        Ok(id)
    }

    /// Population of `name` hosted by the world, if it exists.
    #[must_use]
    pub fn population_named(&self, name: &str) -> Option<PopulationId> {
        if self.model.world_species().name() == name {
            return Some(self.world_population);
        }
        let world = self.agents.get(self.world()?)?;
        world
            .micro_populations()
            .iter()
            .copied()
            .find(|id| self.populations.get(*id).is_some_and(|p| p.species_name() == name))
    }

    /// Population of `species` hosted by `host`.
    pub fn micro_population(&mut self, host: AgentId, species: SpeciesId) -> Result<PopulationId, EvalError> {
        let found = self
            .agent(host)?
            .micro_populations()
            .iter()
            .copied()
            .find(|id| self.populations.get(*id).is_some_and(|p| p.species() == species));
        match found {
            Some(id) => Ok(id),
            None => {
                let name = self.model.species(species).name().to_string();
                self.population_for(&name)
            }
        }
    }

    /// Live members of the world-hosted population named `name`.
    #[must_use]
    pub fn population_agents(&self, name: &str) -> Vec<AgentId> {
        self.population_named(name)
            .and_then(|id| self.populations.get(id))
            .map(|population| {
                population
                    .members()
                    .iter()
                    .copied()
                    .filter(|id| self.is_active(*id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Agent covering `location`. The world population always answers
    /// with the world agent.
    #[must_use]
    pub fn agent_at(&self, population: PopulationId, location: Point) -> Option<AgentId> {
        if population == self.world_population {
            return self.world();
        }
        self.populations
            .get(population)?
            .topology()
            .agent_at(location.into())
            .filter(|id| self.is_active(*id))
    }

    /// Agents within `radius` of `id` in its own and sibling populations,
    /// nearest first.
    pub fn neighbors(&self, id: AgentId, radius: f64) -> Result<Vec<AgentId>, EvalError> {
        let agent = self.agent(id)?;
        let origin = agent.location();
        let siblings = match self.host_of(id).and_then(|host| self.agents.get(host)) {
            Some(host) => host.micro_populations().to_vec(),
            None => vec![agent.population()],
        };
        let mut found: Vec<(AgentId, f64)> = siblings
            .iter()
            .filter_map(|population| self.populations.get(*population))
            .flat_map(|population| population.topology().neighbors(origin.into(), radius))
            .filter(|(other, _)| *other != id)
            .collect();
        found.sort_by_key(|(_, distance)| OrderedFloat(*distance));
        Ok(found.into_iter().map(|(other, _)| other).collect())
    }

    pub fn location(&self, id: AgentId) -> Result<Point, EvalError> {
        self.agent(id).map(Agent::location)
    }

    /// Move an agent and update its topology entry. No-op for the world.
    pub fn set_location(&mut self, id: AgentId, location: Point) -> Result<(), EvalError> {
        self.ensure_alive()?;
        if self.world() == Some(id) {
            return Ok(());
        }
        let location = self.environment.normalize(location);
        let agent = self.agents.get_mut(id).ok_or_else(|| unavailable(id))?;
        agent.shape = agent.shape.moved_to(location);
        let (population, print) = (agent.population, footprint(&agent.shape));
        if let Some(population) = self.populations.get_mut(population) {
            population.update_footprint(id, print)?;
        }
        Ok(())
    }

    /// Replace the world geometry. The shape is translated so its envelope
    /// starts at the origin, the environment is re-derived from it and every
    /// continuous topology is rebuilt from scratch.
    pub fn set_world_geometry(&mut self, shape: Shape) -> Result<(), EvalError> {
        self.ensure_alive()?;
        let world = self
            .world()
            .ok_or_else(|| EvalError::AgentUnavailable("world".into()))?;
        let envelope = shape.envelope();
        let shape = shape.translated_by(-envelope.min_x, -envelope.min_y);
        let width = envelope.width();
        let height = envelope.height();
        if !(width > 0.0) || !(height > 0.0) {
            return Err(EvalError::Topology(
                "world geometry must have a positive extent".into(),
            ));
        }
        self.environment = Environment::new(width, height, self.environment.torus);
        self.agents[world].shape = shape;

        let ids: Vec<PopulationId> = self.populations.keys().collect();
        for id in ids {
            let population = &self.populations[id];
            let Some(settings) = population.topology().settings() else {
                continue;
            };
            let settings = TopologySettings::new(self.environment.bounds, settings.torus, settings.cell_size);
            let entries: Vec<(AgentId, Footprint)> = population
                .members()
                .iter()
                .copied()
                .filter(|member| population.topology().contains(*member))
                .filter_map(|member| {
                    self.agents
                        .get(member)
                        .map(|agent| (member, footprint(agent.shape())))
                })
                .collect();
            let mut topology = Topology::continuous(settings)?;
            topology.rebuild(&entries)?;
            self.populations[id].replace_topology(topology);
        }
        debug!(width, height, "world geometry replaced");
        Ok(())
    }

    /// Read a variable; `location` and `name` are always available.
    pub fn variable(&self, id: AgentId, name: &str) -> Result<Value, EvalError> {
        let agent = self.agent(id)?;
        match name {
            "location" => Ok(Value::Point(agent.location())),
            "name" => Ok(Value::String(agent.name().to_string())),
            _ => agent
                .variable(name)
                .cloned()
                .ok_or_else(|| EvalError::UnknownVariable(name.to_string())),
        }
    }

    pub fn set_variable(&mut self, id: AgentId, name: &str, value: Value) -> Result<(), EvalError> {
        self.ensure_alive()?;
        let species = self.species_of(id)?;
        let model = Arc::clone(&self.model);
        self.assign(id, model.species(species), name, value)
    }

    /// Read a variable of the world agent.
    pub fn world_variable(&self, name: &str) -> Result<Value, EvalError> {
        let world = self
            .world()
            .ok_or_else(|| EvalError::AgentUnavailable("world".into()))?;
        self.variable(world, name)
    }

    /// Move an agent to `Dying`: it leaves its topology now and its
    /// population at the end of the step. Hosted agents die with it.
    pub fn kill(&mut self, id: AgentId) -> Result<(), EvalError> {
        self.ensure_alive()?;
        if self.world() == Some(id) {
            return Err(EvalError::Custom("the world agent cannot die".into()));
        }
        let agent = self.agents.get_mut(id).ok_or_else(|| unavailable(id))?;
        if agent.lifecycle != Lifecycle::Active {
            return Ok(());
        }
        agent.lifecycle = Lifecycle::Dying;
        let population = agent.population;
        let hosted = agent.micro_populations.clone();
        if let Some(population) = self.populations.get_mut(population) {
            population.withdraw(id);
        }
        self.dying.push(id);
        trace!(agent = %self.agent_label(id), "agent dying");
        for micro in hosted {
            let members = self
                .populations
                .get(micro)
                .map(|population| population.members().to_vec())
                .unwrap_or_default();
            for member in members {
                self.kill(member)?;
            }
        }
        Ok(())
    }

    /// Dispose every agent killed during the step.
    fn sweep(&mut self) {
        for id in mem::take(&mut self.dying) {
            if let Some(agent) = self.agents.remove(id) {
                if let Some(population) = self.populations.get_mut(agent.population) {
                    population.evict(id, agent.slot);
                }
                for micro in agent.micro_populations {
                    self.populations.remove(micro);
                }
            }
        }
    }

    /// Advance one tick: the world's reflexes, then every hosted population
    /// in declaration order, then disposal of dead agents.
    pub fn step(&mut self) -> Result<u64, RuntimeError> {
        let world = match (self.disposed, self.world()) {
            (false, Some(world)) if self.set_up => world,
            (true, _) => {
                return Err(RuntimeError::new(EvalError::SimulationDisposed, ScopeContext::default()));
            }
            _ => {
                return Err(RuntimeError::new(
                    EvalError::AgentUnavailable("world".into()),
                    ScopeContext::default(),
                ));
            }
        };
        let mut scope = self.open_scope("step");
        let outcome = self.step_agent(world, &mut scope);
        scope.release();
        outcome?;
        self.sweep();
        self.cycle += 1;
        self.sync_world_counters(world);
        trace!(cycle = self.cycle, agents = self.agents.len(), "step done");
        Ok(self.cycle)
    }

    fn step_agent(&mut self, id: AgentId, scope: &mut Scope) -> Result<(), RuntimeError> {
        if !self.is_active(id) {
            return Ok(());
        }
        scope.push(id);
        let outcome = self
            .run_reflexes(id, scope)
            .map_err(|error| RuntimeError::new(error, self.scope_context(scope)));
        scope.pop();
        outcome?;
        if !self.is_active(id) {
            return Ok(());
        }
        let hosted = self.agents[id].micro_populations.clone();
        for population in hosted {
            let members = self
                .populations
                .get(population)
                .map(|population| population.members().to_vec())
                .unwrap_or_default();
            for member in members {
                self.step_agent(member, scope)?;
            }
        }
        Ok(())
    }

    fn run_reflexes(&mut self, id: AgentId, scope: &mut Scope) -> Result<(), EvalError> {
        let model = Arc::clone(&self.model);
        let species = model.species(self.species_of(id)?);
        for reflex in species.reflexes() {
            if !self.is_active(id) {
                break;
            }
            if let Some(when) = &reflex.when
                && !when.evaluate(self, scope)?.as_bool()
            {
                continue;
            }
            if execute_block(&reflex.body, self, scope)? == Flow::Halt {
                break;
            }
        }
        Ok(())
    }

    /// Evaluate `expr` with the world agent as `self`.
    pub fn evaluate_in_world(&mut self, expr: &CompiledExpr) -> Result<Value, RuntimeError> {
        let Some(world) = self.world() else {
            return Err(RuntimeError::new(
                EvalError::AgentUnavailable("world".into()),
                ScopeContext::default(),
            ));
        };
        let mut scope = self.open_scope("evaluate");
        scope.push(world);
        let value = expr
            .evaluate(self, &mut scope)
            .map_err(|error| RuntimeError::new(error, self.scope_context(&scope)));
        scope.release();
        value
    }

    /// Run `body` with the world as `self`; used by tests and tools that
    /// drive the simulation directly.
    pub fn with_world_scope<T>(
        &mut self,
        purpose: &str,
        body: impl FnOnce(&mut Simulation, &mut Scope) -> Result<T, EvalError>,
    ) -> Result<T, RuntimeError> {
        let Some(world) = self.world() else {
            return Err(RuntimeError::new(
                EvalError::AgentUnavailable("world".into()),
                ScopeContext::default(),
            ));
        };
        let mut scope = self.open_scope(purpose);
        scope.push(world);
        let outcome = body(self, &mut scope).map_err(|error| RuntimeError::new(error, self.scope_context(&scope)));
        scope.release();
        outcome
    }

    /// Release every agent and population and invalidate open scopes.
    /// Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.liveness.revoke();
        let agents = self.agents.len();
        self.agents.clear();
        self.populations.clear();
        self.dying.clear();
        debug!(agents, cycle = self.cycle, "simulation disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelDescriptor;

    fn simulation(json: &str) -> Simulation {
        let registry = Arc::new(Registry::with_builtins());
        let descriptor: ModelDescriptor = serde_json::from_str(json).expect("descriptor");
        let model = Arc::new(Model::compile(&descriptor, &registry).expect("model"));
        Simulation::new(model, registry, SimulationConfig::default()).expect("simulation")
    }

    const ANTS: &str = r#"{
        "name": "ants",
        "environment": {"width": 100.0, "height": 100.0},
        "global": {"variables": [{"name": "rate", "type": "float", "init": {"lit": 0.5}}]},
        "species": [{"name": "ant", "variables": [{"name": "energy", "type": "float", "init": {"lit": 10.0}}]}]
    }"#;

    #[test]
    fn world_is_created_once_at_the_center() {
        let mut sim = simulation(ANTS);
        sim.setup("exp", 42).expect("setup");
        let world = sim.world().expect("world");
        assert_eq!(sim.agent(world).unwrap().index(), 0);
        assert_eq!(sim.location(world).unwrap(), Point::new(50.0, 50.0));
        let world_population = sim.world_population();
        let again = sim
            .with_world_scope("again", |sim, scope| {
                sim.create_agents(scope, world_population, 5, &[], false)
            })
            .expect("create");
        assert_eq!(again, vec![world]);
        assert_eq!(sim.population(world_population).unwrap().len(), 1);
        assert_eq!(sim.world_variable("seed"), Ok(Value::Int(42)));
        assert_eq!(sim.world_variable("rate"), Ok(Value::Float(0.5)));
    }

    #[test]
    fn world_agent_at_ignores_location_and_cannot_move() {
        let mut sim = simulation(ANTS);
        sim.setup("exp", 1).expect("setup");
        let world = sim.world().unwrap();
        assert_eq!(sim.agent_at(sim.world_population(), Point::new(-500.0, 9e9)), Some(world));
        sim.set_location(world, Point::new(3.0, 3.0)).unwrap();
        assert_eq!(sim.location(world).unwrap(), Point::new(50.0, 50.0));
    }

    #[test]
    fn parameters_override_initializers() {
        let mut sim = simulation(ANTS);
        sim.set_parameter("rate", Value::Int(2)).expect("parameter");
        assert!(matches!(
            sim.set_parameter("ghost", Value::Int(1)),
            Err(SetupError::UnresolvedParameter(_))
        ));
        sim.setup("exp", 1).expect("setup");
        assert_eq!(sim.world_variable("rate"), Ok(Value::Float(2.0)));
    }

    #[test]
    fn killed_agents_leave_topology_now_and_population_at_sweep() {
        let mut sim = simulation(ANTS);
        sim.setup("exp", 3).expect("setup");
        let population = sim.population_named("ant").expect("ant population");
        let located = |x: f64| {
            let mut values = BTreeMap::new();
            values.insert("location".to_string(), Value::Point(Point::new(x, 10.0)));
            values
        };
        let ants = sim
            .with_world_scope("spawn", |sim, scope| {
                sim.create_agents(scope, population, 2, &[located(10.0), located(12.0)], false)
            })
            .expect("ants");
        assert_eq!(sim.neighbors(ants[0], 5.0).unwrap(), vec![ants[1]]);
        assert_eq!(sim.lifecycle(ants[1]), Lifecycle::Active);
        sim.kill(ants[1]).unwrap();
        assert_eq!(sim.lifecycle(ants[1]), Lifecycle::Dying);
        assert!(sim.neighbors(ants[0], 5.0).unwrap().is_empty());
        assert_eq!(sim.variable(ants[1], "energy"), Ok(Value::Float(10.0)));
        assert_eq!(sim.population(population).unwrap().len(), 2);
        sim.step().expect("step");
        assert_eq!(sim.population(population).unwrap().members(), &[ants[0]]);
        assert_eq!(sim.lifecycle(ants[1]), Lifecycle::Disposed);
        assert_eq!(sim.lifecycle(ants[0]), Lifecycle::Active);
        assert!(matches!(
            sim.variable(ants[1], "energy"),
            Err(EvalError::AgentUnavailable(_))
        ));
    }

    #[test]
    fn strict_policy_rejects_short_initial_values() {
        let registry = Arc::new(Registry::with_builtins());
        let descriptor: ModelDescriptor = serde_json::from_str(ANTS).expect("descriptor");
        let model = Arc::new(Model::compile(&descriptor, &registry).expect("model"));
        let config = SimulationConfig {
            initial_values: InitialValuesPolicy::Strict,
            ..SimulationConfig::default()
        };
        let mut sim = Simulation::new(model, registry, config).expect("simulation");
        sim.setup("exp", 0).expect("setup");
        let population = sim.population_named("ant").unwrap();
        let result = sim.with_world_scope("spawn", |sim, scope| {
            sim.create_agents(scope, population, 3, &[BTreeMap::new()], false)
        });
        assert_eq!(
            result.map_err(|error| error.error),
            Err(EvalError::InitialValuesMismatch {
                expected: 3,
                found: 1
            })
        );
    }

    #[test]
    fn builtin_population_is_created_lazily_once() {
        let mut sim = simulation(ANTS);
        sim.setup("exp", 0).expect("setup");
        assert_eq!(sim.population_named("agent"), None);
        let first = sim.population_for("agent").expect("agent population");
        let second = sim.population_for("agent").expect("agent population");
        assert_eq!(first, second);
        assert!(matches!(
            sim.population_for("unicorn"),
            Err(EvalError::UnknownSpecies(_))
        ));
    }

    #[test]
    fn world_geometry_is_translated_to_the_origin() {
        let mut sim = simulation(ANTS);
        sim.setup("exp", 0).expect("setup");
        let population = sim.population_named("ant").unwrap();
        let ant = sim
            .with_world_scope("spawn", |sim, scope| sim.create_agents(scope, population, 1, &[], false))
            .unwrap()[0];
        sim.set_world_geometry(Shape::rectangle(40.0, 20.0, Point::new(100.0, 100.0)))
            .expect("geometry");
        assert_eq!(sim.environment().width(), 40.0);
        assert_eq!(sim.location(sim.world().unwrap()).unwrap(), Point::new(20.0, 10.0));
        assert!(sim.population(population).unwrap().topology().contains(ant));
    }

    #[test]
    fn dispose_invalidates_scopes_and_is_idempotent() {
        let mut sim = simulation(ANTS);
        sim.setup("exp", 0).expect("setup");
        let mut scope = sim.open_scope("late");
        assert_eq!(sim.open_scopes(), 1);
        sim.dispose();
        sim.dispose();
        assert!(sim.is_disposed());
        assert_eq!(scope.current_agent(), Err(EvalError::SimulationDisposed));
        scope.release();
        assert_eq!(sim.open_scopes(), 0);
        assert!(sim.step().is_err());
    }
}
