//! Extension registry binding language keywords to executable behaviour.
//!
//! Contributors are plain functions that register primitives into a
//! [`RegistryBuilder`]. Once every contributor ran, [`RegistryBuilder::freeze`]
//! yields an immutable [`Registry`] that can be shared across threads and
//! consulted concurrently by the compiler and evaluators.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::AgentId;
use crate::error::{EvalError, RegistryError};
use crate::scope::Scope;
use crate::simulation::Simulation;
use crate::value::{Value, ValueType};

/// Read-only view handed to operator handlers.
pub struct OpContext<'a> {
    pub sim: &'a Simulation,
    pub scope: &'a mut Scope,
}

/// Mutable view handed to skill actions.
pub struct ActionContext<'a> {
    pub sim: &'a mut Simulation,
    pub scope: &'a mut Scope,
    pub agent: AgentId,
    pub args: &'a BTreeMap<String, Value>,
}

impl ActionContext<'_> {
    /// Named argument or `None` when absent or nil.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name).filter(|value| !value.is_nil())
    }

    pub fn float_arg(&self, name: &str) -> Result<Option<f64>, EvalError> {
        match self.arg(name) {
            None => Ok(None),
            Some(value) => value.as_float().map(Some).ok_or(EvalError::TypeMismatch {
                expected: ValueType::Float,
                found: value.value_type(),
            }),
        }
    }
}

pub type OperatorFn =
    Arc<dyn Fn(&mut OpContext<'_>, &[Value]) -> Result<Value, EvalError> + Send + Sync>;

pub type ActionFn = Arc<dyn Fn(&mut ActionContext<'_>) -> Result<Value, EvalError> + Send + Sync>;

/// A function registering primitives during the open phase.
pub type Contributor = fn(&mut RegistryBuilder);

/// Category of a registered primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Operator,
    Type,
    Species,
    Skill,
}

/// Reserved species roles, each bound to one species class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeciesRole {
    World,
    Default,
    Experimentator,
}

#[derive(Clone)]
pub struct OperatorEntry {
    pub keyword: String,
    pub signature: Vec<ValueType>,
    pub returns: ValueType,
    pub handler: OperatorFn,
}

impl OperatorEntry {
    #[must_use]
    pub fn arity(&self) -> usize {
        self.signature.len()
    }

    /// Conversion cost of calling this entry with `args`, `None` if impossible.
    fn match_cost(&self, args: &[ValueType]) -> Option<u32> {
        if args.len() != self.signature.len() {
            return None;
        }
        self.signature
            .iter()
            .zip(args)
            .try_fold(0, |total, (param, arg)| {
                let cost = if param == arg {
                    0
                } else if *param == ValueType::Float && *arg == ValueType::Int {
                    1
                } else if *arg == ValueType::Any || *arg == ValueType::Nil {
                    2
                } else if *param == ValueType::Any {
                    3
                } else {
                    return None;
                };
                Some(total + cost)
            })
    }
}

impl fmt::Debug for OperatorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorEntry")
            .field("keyword", &self.keyword)
            .field("signature", &self.signature)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

/// Variable contributed by a built-in species or a skill.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinVariable {
    pub name: String,
    pub ty: ValueType,
    pub default: Value,
}

impl BuiltinVariable {
    #[must_use]
    pub fn new(name: &str, ty: ValueType, default: Value) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default,
        }
    }
}

#[derive(Clone)]
pub struct ActionEntry {
    pub name: String,
    pub args: Vec<(String, ValueType)>,
    pub returns: ValueType,
    pub handler: ActionFn,
}

impl fmt::Debug for ActionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionEntry")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub keyword: String,
    pub ty: ValueType,
}

/// Species class contributed by an extension.
#[derive(Debug, Clone)]
pub struct SpeciesPrototype {
    pub name: String,
    pub role: Option<SpeciesRole>,
    pub variables: Vec<BuiltinVariable>,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SkillEntry {
    pub name: String,
    pub variables: Vec<BuiltinVariable>,
    pub actions: Vec<ActionEntry>,
}

/// Anything a contributor can register.
#[derive(Debug, Clone)]
pub enum Primitive {
    Operator(OperatorEntry),
    Type(TypeEntry),
    Species(SpeciesPrototype),
    Skill(SkillEntry),
}

impl Primitive {
    #[must_use]
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Self::Operator(_) => PrimitiveKind::Operator,
            Self::Type(_) => PrimitiveKind::Type,
            Self::Species(_) => PrimitiveKind::Species,
            Self::Skill(_) => PrimitiveKind::Skill,
        }
    }
}

fn signature_label(types: &[ValueType]) -> String {
    let names: Vec<&str> = types.iter().map(|ty| ty.keyword()).collect();
    format!("({})", names.join(", "))
}

/// Open phase of the registry: accepts registrations, serves no lookups.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    operators: HashMap<String, Vec<OperatorEntry>>,
    types: HashMap<String, ValueType>,
    species: HashMap<String, SpeciesPrototype>,
    skills: HashMap<String, SkillEntry>,
    slots: HashMap<SpeciesRole, String>,
    overwritten: usize,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one contributor against this builder.
    pub fn contribute(&mut self, contributor: Contributor) -> &mut Self {
        contributor(self);
        self
    }

    /// Add or overwrite a binding. Duplicate operator signatures are
    /// last-write-wins and reported with a warning.
    pub fn register(&mut self, primitive: Primitive) -> &mut Self {
        match primitive {
            Primitive::Operator(entry) => {
                let bucket = self.operators.entry(entry.keyword.clone()).or_default();
                if let Some(existing) = bucket
                    .iter_mut()
                    .find(|existing| existing.signature == entry.signature)
                {
                    warn!(
                        keyword = %entry.keyword,
                        signature = %signature_label(&entry.signature),
                        "operator re-registered; last registration wins"
                    );
                    *existing = entry;
                    self.overwritten += 1;
                } else {
                    bucket.push(entry);
                }
            }
            Primitive::Type(entry) => {
                if self.types.insert(entry.keyword.clone(), entry.ty).is_some() {
                    warn!(keyword = %entry.keyword, "type re-registered; last registration wins");
                    self.overwritten += 1;
                }
            }
            Primitive::Species(prototype) => {
                if let Some(role) = prototype.role {
                    self.slots
                        .entry(role)
                        .or_insert_with(|| prototype.name.clone());
                }
                if self
                    .species
                    .insert(prototype.name.clone(), prototype)
                    .is_some()
                {
                    self.overwritten += 1;
                }
            }
            Primitive::Skill(skill) => {
                if let Some(previous) = self.skills.insert(skill.name.clone(), skill) {
                    warn!(skill = %previous.name, "skill re-registered; last registration wins");
                    self.overwritten += 1;
                }
            }
        }
        self
    }

    pub fn operator<F>(
        &mut self,
        keyword: &str,
        signature: &[ValueType],
        returns: ValueType,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(&mut OpContext<'_>, &[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.register(Primitive::Operator(OperatorEntry {
            keyword: keyword.to_string(),
            signature: signature.to_vec(),
            returns,
            handler: Arc::new(handler),
        }))
    }

    pub fn type_keyword(&mut self, ty: ValueType) -> &mut Self {
        self.register(Primitive::Type(TypeEntry {
            keyword: ty.keyword().to_string(),
            ty,
        }))
    }

    pub fn species(&mut self, prototype: SpeciesPrototype) -> &mut Self {
        self.register(Primitive::Species(prototype))
    }

    pub fn skill(&mut self, skill: SkillEntry) -> &mut Self {
        self.register(Primitive::Skill(skill))
    }

    /// Close the registration phase.
    #[must_use]
    pub fn freeze(self) -> Registry {
        debug!(
            operators = self.operators.values().map(Vec::len).sum::<usize>(),
            types = self.types.len(),
            species = self.species.len(),
            skills = self.skills.len(),
            overwritten = self.overwritten,
            "registry frozen"
        );
        Registry {
            operators: self.operators,
            types: self.types,
            species: self.species,
            skills: self.skills,
            slots: self.slots,
        }
    }
}

/// Frozen, read-only registry.
#[derive(Debug)]
pub struct Registry {
    operators: HashMap<String, Vec<OperatorEntry>>,
    types: HashMap<String, ValueType>,
    species: HashMap<String, SpeciesPrototype>,
    skills: HashMap<String, SkillEntry>,
    slots: HashMap<SpeciesRole, String>,
}

impl Registry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Registry built from the given contributors, in order.
    #[must_use]
    pub fn from_contributors(contributors: &[Contributor]) -> Self {
        let mut builder = RegistryBuilder::new();
        for contributor in contributors {
            builder.contribute(*contributor);
        }
        builder.freeze()
    }

    /// Registry holding the built-in language primitives.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::from_contributors(crate::builtins::CONTRIBUTORS)
    }

    /// Best handler for `keyword` called with `args`.
    ///
    /// Exact signatures beat int-to-float promotion, which beats dynamic
    /// (`any`) arguments, which beat `any` parameters. Ties go to the
    /// earliest registration.
    pub fn resolve(&self, keyword: &str, args: &[ValueType]) -> Result<&OperatorEntry, RegistryError> {
        self.operators
            .get(keyword)
            .and_then(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.match_cost(args).map(|cost| (cost, entry)))
                    .min_by_key(|(cost, _)| *cost)
                    .map(|(_, entry)| entry)
            })
            .ok_or_else(|| RegistryError::NoHandler {
                keyword: keyword.to_string(),
                signature: signature_label(args),
            })
    }

    /// Every entry `keyword` could dispatch to when called with `args`.
    #[must_use]
    pub fn candidates(&self, keyword: &str, args: &[ValueType]) -> Vec<&OperatorEntry> {
        self.operators
            .get(keyword)
            .into_iter()
            .flatten()
            .filter(|entry| entry.match_cost(args).is_some())
            .collect()
    }

    #[must_use]
    pub fn has_operator(&self, keyword: &str) -> bool {
        self.operators.contains_key(keyword)
    }

    pub fn type_named(&self, keyword: &str) -> Result<ValueType, RegistryError> {
        self.types
            .get(keyword)
            .copied()
            .ok_or_else(|| RegistryError::UnknownType(keyword.to_string()))
    }

    #[must_use]
    pub fn is_builtin_species(&self, name: &str) -> bool {
        self.species.contains_key(name)
    }

    #[must_use]
    pub fn species_prototype(&self, name: &str) -> Option<&SpeciesPrototype> {
        self.species.get(name)
    }

    /// Built-in species prototypes ordered by name.
    #[must_use]
    pub fn species_prototypes(&self) -> Vec<&SpeciesPrototype> {
        let mut prototypes: Vec<&SpeciesPrototype> = self.species.values().collect();
        prototypes.sort_by(|a, b| a.name.cmp(&b.name));
        prototypes
    }

    /// Skills attached to a built-in species; empty for unknown names.
    #[must_use]
    pub fn skills_for(&self, species: &str) -> &[String] {
        self.species
            .get(species)
            .map_or(&[], |prototype| prototype.skills.as_slice())
    }

    pub fn skill(&self, name: &str) -> Result<&SkillEntry, RegistryError> {
        self.skills
            .get(name)
            .ok_or_else(|| RegistryError::UnknownSkill(name.to_string()))
    }

    /// Species class bound to a reserved role.
    #[must_use]
    pub fn slot(&self, role: SpeciesRole) -> Option<&SpeciesPrototype> {
        self.slots.get(&role).and_then(|name| self.species.get(name))
    }

    /// Number of registered entries of a kind.
    #[must_use]
    pub fn count(&self, kind: PrimitiveKind) -> usize {
        match kind {
            PrimitiveKind::Operator => self.operators.values().map(Vec::len).sum(),
            PrimitiveKind::Type => self.types.len(),
            PrimitiveKind::Species => self.species.len(),
            PrimitiveKind::Skill => self.skills.len(),
        }
    }
}
