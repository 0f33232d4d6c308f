//! Species declarations and their compilation into flat runtime tables.
//!
//! Compilation runs in two passes. The first assigns ids to every declared
//! species, walks parent chains and skills once, and builds flat variable
//! and action tables. The second compiles initializers, reflexes and init
//! blocks against those tables, so behaviour may reference any species.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::expr::{CompileContext, CompiledExpr, Expr};
use crate::registry::{ActionEntry, BuiltinVariable, Registry, SpeciesPrototype, SpeciesRole};
use crate::statement::{CompiledStatement, Statement, compile_block};
use crate::value::{Value, ValueType};

/// Index of a species inside its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeciesId(pub usize);

impl SpeciesId {
    /// The world species always comes first.
    pub const WORLD: SpeciesId = SpeciesId(0);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    #[default]
    Continuous,
    Amorphous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: ValueType,
    #[serde(default)]
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflexDecl {
    pub name: String,
    #[serde(default)]
    pub when: Option<Expr>,
    #[serde(default)]
    pub body: Vec<Statement>,
}

/// Parsed species declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeciesDecl {
    pub name: String,
    pub parent: Option<String>,
    pub skills: Vec<String>,
    pub variables: Vec<VariableDecl>,
    pub reflexes: Vec<ReflexDecl>,
    pub init: Vec<Statement>,
    /// Micro-species hosted by agents of this species.
    pub species: Vec<SpeciesDecl>,
    pub topology: TopologyKind,
    /// Radius of the disc agents occupy; the configured default when absent.
    pub footprint: Option<f64>,
}

/// Variable of a species' flat table.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSlot {
    pub name: String,
    pub ty: ValueType,
    pub default: Value,
}

impl From<&BuiltinVariable> for VariableSlot {
    fn from(variable: &BuiltinVariable) -> Self {
        Self {
            name: variable.name.clone(),
            ty: variable.ty,
            default: variable.default.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledReflex {
    pub name: String,
    pub when: Option<CompiledExpr>,
    pub body: Vec<CompiledStatement>,
}

/// Compiled species: flat variable and action tables plus behaviour.
#[derive(Debug, Clone)]
pub struct Species {
    id: SpeciesId,
    name: String,
    parent: Option<SpeciesId>,
    host: Option<SpeciesId>,
    builtin: bool,
    skills: Vec<String>,
    variables: Vec<VariableSlot>,
    actions: HashMap<String, ActionEntry>,
    micro: Vec<SpeciesId>,
    topology: TopologyKind,
    footprint: Option<f64>,
    initializers: Vec<(String, CompiledExpr)>,
    reflexes: Vec<CompiledReflex>,
    init: Vec<CompiledStatement>,
}

impl Species {
    #[must_use]
    pub fn id(&self) -> SpeciesId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<SpeciesId> {
        self.parent
    }

    /// Species of the agents hosting this one; `None` for the world.
    #[must_use]
    pub fn host(&self) -> Option<SpeciesId> {
        self.host
    }

    /// Whether the species comes from the registry rather than the model.
    #[must_use]
    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    #[must_use]
    pub fn skills(&self) -> &[String] {
        &self.skills
    }

    #[must_use]
    pub fn has_skill(&self, skill: &str) -> bool {
        self.skills.iter().any(|candidate| candidate == skill)
    }

    #[must_use]
    pub fn variables(&self) -> &[VariableSlot] {
        &self.variables
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&VariableSlot> {
        self.variables.iter().find(|slot| slot.name == name)
    }

    #[must_use]
    pub fn variable_type(&self, name: &str) -> Option<ValueType> {
        self.variable(name).map(|slot| slot.ty)
    }

    #[must_use]
    pub fn action(&self, name: &str) -> Option<&ActionEntry> {
        self.actions.get(name)
    }

    #[must_use]
    pub fn micro_species(&self) -> &[SpeciesId] {
        &self.micro
    }

    #[must_use]
    pub fn topology(&self) -> TopologyKind {
        self.topology
    }

    #[must_use]
    pub fn footprint(&self) -> Option<f64> {
        self.footprint
    }

    pub(crate) fn initializers(&self) -> &[(String, CompiledExpr)] {
        &self.initializers
    }

    pub(crate) fn reflexes(&self) -> &[CompiledReflex] {
        &self.reflexes
    }

    pub(crate) fn init(&self) -> &[CompiledStatement] {
        &self.init
    }
}

struct Entry<'d> {
    name: String,
    decl: Option<&'d SpeciesDecl>,
    prototype: Option<&'d SpeciesPrototype>,
    host: Option<SpeciesId>,
    micro: Vec<SpeciesId>,
}

#[derive(Clone, Default)]
struct Flat<'d> {
    parent: Option<SpeciesId>,
    variables: Vec<VariableSlot>,
    skills: Vec<String>,
    inits: Vec<(String, &'d Expr)>,
    reflexes: Vec<&'d ReflexDecl>,
    init: &'d [Statement],
}

impl<'d> Flat<'d> {
    fn merge_variable(&mut self, slot: VariableSlot) {
        match self.variables.iter_mut().find(|existing| existing.name == slot.name) {
            Some(existing) => *existing = slot,
            None => self.variables.push(slot),
        }
    }

    fn add_builtin_variables(&mut self, variables: &[BuiltinVariable]) {
        for variable in variables {
            if self.variables.iter().all(|existing| existing.name != variable.name) {
                self.variables.push(variable.into());
            }
        }
    }

    fn add_skill(&mut self, registry: &Registry, species: &str, skill: &str) -> Result<(), CompileError> {
        if self.skills.iter().any(|existing| existing == skill) {
            return Ok(());
        }
        let entry = registry.skill(skill).map_err(|_| CompileError::UnknownSkill {
            species: species.to_string(),
            skill: skill.to_string(),
        })?;
        self.skills.push(skill.to_string());
        self.add_builtin_variables(&entry.variables);
        Ok(())
    }

    fn add_prototype(&mut self, registry: &Registry, prototype: &SpeciesPrototype) -> Result<(), CompileError> {
        self.add_builtin_variables(&prototype.variables);
        for skill in &prototype.skills {
            self.add_skill(registry, &prototype.name, skill)?;
        }
        Ok(())
    }

    fn inherit(&mut self, parent: Flat<'d>) {
        for slot in parent.variables {
            self.merge_variable(slot);
        }
        for skill in parent.skills {
            if !self.skills.contains(&skill) {
                self.skills.push(skill);
            }
        }
        self.inits.extend(parent.inits);
        self.reflexes.extend(parent.reflexes);
        self.init = parent.init;
    }
}

struct Collector<'d> {
    registry: &'d Registry,
    entries: Vec<Entry<'d>>,
    names: HashMap<String, SpeciesId>,
}

impl<'d> Collector<'d> {
    fn add(
        &mut self,
        name: String,
        decl: Option<&'d SpeciesDecl>,
        prototype: Option<&'d SpeciesPrototype>,
        host: Option<SpeciesId>,
    ) -> Result<SpeciesId, CompileError> {
        let id = SpeciesId(self.entries.len());
        if self.names.insert(name.clone(), id).is_some() {
            return Err(CompileError::DuplicateSpecies(name));
        }
        self.entries.push(Entry {
            name,
            decl,
            prototype,
            host,
            micro: Vec::new(),
        });
        Ok(id)
    }

    fn add_declared(&mut self, decl: &'d SpeciesDecl, host: SpeciesId) -> Result<SpeciesId, CompileError> {
        let id = self.add(decl.name.clone(), Some(decl), None, Some(host))?;
        for child in &decl.species {
            let child_id = self.add_declared(child, id)?;
            self.entries[id.0].micro.push(child_id);
        }
        Ok(id)
    }

    fn flatten(
        &self,
        id: SpeciesId,
        cache: &mut Vec<Option<Flat<'d>>>,
        visiting: &mut Vec<SpeciesId>,
    ) -> Result<Flat<'d>, CompileError> {
        if let Some(flat) = &cache[id.0] {
            return Ok(flat.clone());
        }
        let entry = &self.entries[id.0];
        if visiting.contains(&id) {
            return Err(CompileError::InheritanceCycle(entry.name.clone()));
        }
        visiting.push(id);

        let mut flat = Flat::default();
        if let Some(default) = self.registry.slot(SpeciesRole::Default) {
            flat.add_prototype(self.registry, default)?;
        }
        if id == SpeciesId::WORLD
            && let Some(world) = self.registry.slot(SpeciesRole::World)
        {
            flat.add_prototype(self.registry, world)?;
        }
        if let Some(prototype) = entry.prototype {
            flat.add_prototype(self.registry, prototype)?;
        }
        if let Some(decl) = entry.decl {
            if let Some(parent) = &decl.parent {
                if let Some(parent_id) = self.names.get(parent).copied() {
                    let inherited = self.flatten(parent_id, cache, visiting)?;
                    flat.inherit(inherited);
                    flat.parent = Some(parent_id);
                } else if let Some(prototype) = self.registry.species_prototype(parent) {
                    flat.add_prototype(self.registry, prototype)?;
                } else {
                    return Err(CompileError::UnknownSpecies(parent.clone()));
                }
            }
            for skill in &decl.skills {
                flat.add_skill(self.registry, &entry.name, skill)?;
            }
            for variable in &decl.variables {
                flat.merge_variable(VariableSlot {
                    name: variable.name.clone(),
                    ty: variable.ty,
                    default: variable.ty.default_value(),
                });
                if let Some(init) = &variable.init {
                    flat.inits.retain(|(name, _)| *name != variable.name);
                    flat.inits.push((variable.name.clone(), init));
                }
            }
            flat.reflexes.extend(decl.reflexes.iter());
            if !decl.init.is_empty() {
                flat.init = &decl.init;
            }
        }

        visiting.pop();
        cache[id.0] = Some(flat.clone());
        Ok(flat)
    }
}

/// Compile the world species, its nested species and the registry's
/// built-in species into one table indexed by [`SpeciesId`].
pub(crate) fn compile_species(
    world_name: &str,
    global: &SpeciesDecl,
    top_level: &[SpeciesDecl],
    registry: &Registry,
) -> Result<Vec<Species>, CompileError> {
    let mut collector = Collector {
        registry,
        entries: Vec::new(),
        names: HashMap::new(),
    };
    collector.add(world_name.to_string(), Some(global), None, None)?;
    for decl in global.species.iter().chain(top_level) {
        let id = collector.add_declared(decl, SpeciesId::WORLD)?;
        collector.entries[SpeciesId::WORLD.0].micro.push(id);
    }
    for prototype in registry.species_prototypes() {
        let reserved = matches!(
            prototype.role,
            Some(SpeciesRole::World | SpeciesRole::Experimentator)
        );
        if !reserved && !collector.names.contains_key(&prototype.name) {
            collector.add(
                prototype.name.clone(),
                None,
                Some(prototype),
                Some(SpeciesId::WORLD),
            )?;
        }
    }

    let mut cache = vec![None; collector.entries.len()];
    let mut flats = Vec::with_capacity(collector.entries.len());
    for index in 0..collector.entries.len() {
        flats.push(collector.flatten(SpeciesId(index), &mut cache, &mut Vec::new())?);
    }

    let mut species: Vec<Species> = collector
        .entries
        .iter()
        .zip(&flats)
        .enumerate()
        .map(|(index, (entry, flat))| {
            let actions = flat
                .skills
                .iter()
                .filter_map(|skill| registry.skill(skill).ok())
                .flat_map(|skill| skill.actions.iter())
                .map(|action| (action.name.clone(), action.clone()))
                .collect();
            Species {
                id: SpeciesId(index),
                name: entry.name.clone(),
                parent: flat.parent,
                host: entry.host,
                builtin: entry.prototype.is_some(),
                skills: flat.skills.clone(),
                variables: flat.variables.clone(),
                actions,
                micro: entry.micro.clone(),
                topology: entry.decl.map(|decl| decl.topology).unwrap_or_default(),
                footprint: entry.decl.and_then(|decl| decl.footprint),
                initializers: Vec::new(),
                reflexes: Vec::new(),
                init: Vec::new(),
            }
        })
        .collect();

    let mut behaviours = Vec::with_capacity(species.len());
    for (index, flat) in flats.iter().enumerate() {
        let id = SpeciesId(index);
        let mut ctx = CompileContext::new(registry, &species, id);
        let mut initializers = Vec::with_capacity(flat.inits.len());
        for (name, expr) in &flat.inits {
            let compiled = expr.compile(&ctx)?;
            let expected = species[index].variable_type(name).unwrap_or_default();
            if !expected.accepts(compiled.value_type()) && compiled.value_type() != ValueType::Any {
                return Err(CompileError::TypeMismatch {
                    name: name.clone(),
                    expected,
                    found: compiled.value_type(),
                });
            }
            initializers.push((name.clone(), compiled));
        }
        let mut reflexes = Vec::with_capacity(flat.reflexes.len());
        for reflex in &flat.reflexes {
            let when = reflex.when.as_ref().map(|when| when.compile(&ctx)).transpose()?;
            reflexes.push(CompiledReflex {
                name: reflex.name.clone(),
                when,
                body: compile_block(&reflex.body, &mut ctx)?,
            });
        }
        let init = compile_block(flat.init, &mut ctx)?;
        behaviours.push((initializers, reflexes, init));
    }
    for (target, (initializers, reflexes, init)) in species.iter_mut().zip(behaviours) {
        target.initializers = initializers;
        target.reflexes = reflexes;
        target.init = init;
    }
    Ok(species)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(json: &str) -> SpeciesDecl {
        serde_json::from_str(json).expect("species decl")
    }

    #[test]
    fn flattens_parent_chain_and_skills() {
        let registry = Registry::with_builtins();
        let global = decl(r#"{"name": "world", "variables": [{"name": "food", "type": "int"}]}"#);
        let animal = decl(
            r#"{"name": "animal", "skills": ["moving"],
                "variables": [{"name": "energy", "type": "float", "init": {"lit": 10.0}}]}"#,
        );
        let ant = decl(
            r#"{"name": "ant", "parent": "animal",
                "variables": [{"name": "carrying", "type": "bool"}],
                "reflexes": [{"name": "walk", "body": [{"do": {"action": "wander"}}]}]}"#,
        );
        let species = compile_species("world", &global, &[animal, ant], &registry).expect("compile");
        let ant = species.iter().find(|s| s.name() == "ant").expect("ant");
        assert_eq!(ant.parent(), Some(SpeciesId(1)));
        assert!(ant.has_skill("moving"));
        assert!(ant.action("wander").is_some());
        assert_eq!(ant.variable_type("energy"), Some(ValueType::Float));
        assert_eq!(ant.variable_type("speed"), Some(ValueType::Float));
        assert_eq!(ant.variable_type("location"), Some(ValueType::Point));
        assert_eq!(ant.initializers().len(), 1);
        assert_eq!(ant.reflexes().len(), 1);
        assert_eq!(ant.host(), Some(SpeciesId::WORLD));
        let world = &species[0];
        assert_eq!(world.variable_type("cycle"), Some(ValueType::Int));
        assert_eq!(world.micro_species(), &[SpeciesId(1), SpeciesId(2)]);
        assert!(species.iter().any(|s| s.is_builtin() && s.name() == "agent"));
    }

    #[test]
    fn nested_species_reach_host_variables() {
        let registry = Registry::with_builtins();
        let global = decl(r#"{"variables": [{"name": "rate", "type": "float"}]}"#);
        let hive = decl(
            r#"{"name": "hive", "variables": [{"name": "honey", "type": "float"}],
                "species": [{"name": "bee", "reflexes": [{"name": "work", "body": [
                    {"set": {"var": "honey", "value": {"call": {"op": "+", "args": [{"var": "honey"}, {"var": "rate"}]}}}}
                ]}]}]}"#,
        );
        let species = compile_species("world", &global, &[hive], &registry).expect("compile");
        let bee = species.iter().find(|s| s.name() == "bee").expect("bee");
        assert_eq!(bee.host(), Some(SpeciesId(1)));
        assert_eq!(species[1].micro_species(), &[bee.id()]);
    }

    #[test]
    fn reports_compile_errors_eagerly() {
        let registry = Registry::with_builtins();
        let global = SpeciesDecl::default();
        let unknown_var = decl(r#"{"name": "a", "init": [{"set": {"var": "ghost", "value": {"lit": 1}}}]}"#);
        assert!(matches!(
            compile_species("world", &global, &[unknown_var], &registry),
            Err(CompileError::UnknownVariable { .. })
        ));
        let unknown_op = decl(
            r#"{"name": "a", "variables": [{"name": "x", "type": "int", "init": {"call": {"op": "frobnicate", "args": []}}}]}"#,
        );
        assert!(matches!(
            compile_species("world", &global, &[unknown_op], &registry),
            Err(CompileError::Registry(_))
        ));
        let cycle = [
            decl(r#"{"name": "a", "parent": "b"}"#),
            decl(r#"{"name": "b", "parent": "a"}"#),
        ];
        assert!(matches!(
            compile_species("world", &global, &cycle, &registry),
            Err(CompileError::InheritanceCycle(_))
        ));
        let twice = [decl(r#"{"name": "a"}"#), decl(r#"{"name": "a"}"#)];
        assert!(matches!(
            compile_species("world", &global, &twice, &registry),
            Err(CompileError::DuplicateSpecies(_))
        ));
    }

    #[test]
    fn socialize_requires_a_social_caller() {
        let registry = Registry::with_builtins();
        let global = SpeciesDecl::default();
        let lonely = decl(r#"{"name": "lonely", "init": [{"socialize": {}}]}"#);
        assert_eq!(
            compile_species("world", &global, &[lonely], &registry).err(),
            Some(CompileError::MissingCaller("socialize"))
        );
        let people = decl(
            r#"{"name": "person", "reflexes": [{"name": "meet", "body": [
                {"ask": {"target": {"call": {"op": "agents_at_distance", "args": [{"lit": 5.0}]}},
                         "species": "person", "body": [{"socialize": {}}]}}
            ]}]}"#,
        );
        assert_eq!(
            compile_species("world", &global, &[people.clone()], &registry).err(),
            Some(CompileError::MissingSocialSkill("person".into()))
        );
        let social = SpeciesDecl {
            skills: vec!["social".into()],
            ..people
        };
        assert!(compile_species("world", &global, &[social], &registry).is_ok());
    }
}
