//! Statements executed by agents during initialisation and reflexes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::error::{CompileError, EvalError};
use crate::expr::{CompileContext, CompiledExpr, Expr};
use crate::registry::{ActionContext, ActionEntry};
use crate::scope::Scope;
use crate::simulation::Simulation;
use crate::species::SpeciesId;
use crate::value::{Value, ValueType};

/// Skill that enables `socialize`.
pub const SOCIAL_SKILL: &str = "social";
/// Variable holding the links created by `socialize`.
pub const SOCIAL_LINKS: &str = "social_links";

/// `with:` entry of a `create` statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    pub var: String,
    pub value: Expr,
}

/// Parsed statement, as produced by the model parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    Set {
        var: String,
        value: Expr,
    },
    Let {
        name: String,
        value: Expr,
    },
    If {
        cond: Expr,
        #[serde(default)]
        then: Vec<Statement>,
        #[serde(default)]
        otherwise: Vec<Statement>,
    },
    Loop {
        times: Expr,
        #[serde(default)]
        body: Vec<Statement>,
    },
    Create {
        species: String,
        #[serde(default)]
        count: Option<Expr>,
        #[serde(default)]
        with: Vec<Initializer>,
        #[serde(default)]
        bind: Option<String>,
    },
    Die,
    Ask {
        target: Expr,
        species: String,
        #[serde(default)]
        body: Vec<Statement>,
    },
    Do {
        action: String,
        #[serde(default)]
        args: BTreeMap<String, Expr>,
    },
    Socialize {
        #[serde(default)]
        agent: Option<Expr>,
        #[serde(default)]
        appreciation: Option<Expr>,
        #[serde(default)]
        dominance: Option<Expr>,
        #[serde(default)]
        solidarity: Option<Expr>,
        #[serde(default)]
        familiarity: Option<Expr>,
        #[serde(default)]
        when: Option<Expr>,
    },
}

/// Whether the executing agent keeps running its behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The agent died; the rest of its behaviour is skipped.
    Halt,
}

#[derive(Debug, Clone)]
enum SetTarget {
    Local(String),
    Own(String),
    Host { levels: usize, name: String },
}

#[derive(Debug, Clone)]
enum CreateTarget {
    /// Micro-species of the agent `host_levels` hosts above the creator.
    Micro {
        host_levels: usize,
        species: SpeciesId,
    },
    /// Built-in species, hosted by the world and created on first use.
    Builtin(String),
}

#[derive(Debug, Clone)]
struct SocialFacets {
    agent: Option<CompiledExpr>,
    appreciation: Option<CompiledExpr>,
    dominance: Option<CompiledExpr>,
    solidarity: Option<CompiledExpr>,
    familiarity: Option<CompiledExpr>,
}

#[derive(Debug, Clone)]
enum StatementKind {
    Set {
        target: SetTarget,
        value: CompiledExpr,
    },
    Let {
        name: String,
        value: CompiledExpr,
    },
    If {
        cond: CompiledExpr,
        then: Vec<CompiledStatement>,
        otherwise: Vec<CompiledStatement>,
    },
    Loop {
        times: CompiledExpr,
        body: Vec<CompiledStatement>,
    },
    Create {
        target: CreateTarget,
        count: Option<CompiledExpr>,
        with: Vec<(String, CompiledExpr)>,
        bind: Option<String>,
    },
    Die,
    Ask {
        target: CompiledExpr,
        species: SpeciesId,
        body: Vec<CompiledStatement>,
    },
    Do {
        action: ActionEntry,
        args: Vec<(String, CompiledExpr)>,
    },
    Socialize {
        facets: Box<SocialFacets>,
        when: Option<CompiledExpr>,
    },
}

/// Statement with resolved names, ready to execute.
#[derive(Debug, Clone)]
pub struct CompiledStatement {
    kind: StatementKind,
}

fn check_assignable(name: &str, expected: ValueType, found: ValueType) -> Result<(), CompileError> {
    if expected.accepts(found) || found == ValueType::Any {
        Ok(())
    } else {
        Err(CompileError::TypeMismatch {
            name: name.to_string(),
            expected,
            found,
        })
    }
}

fn compile_optional(
    expr: Option<&Expr>,
    ctx: &CompileContext<'_>,
) -> Result<Option<CompiledExpr>, CompileError> {
    expr.map(|expr| expr.compile(ctx)).transpose()
}

/// Compile a block; locals declared inside do not leak out.
pub(crate) fn compile_block(
    body: &[Statement],
    ctx: &mut CompileContext<'_>,
) -> Result<Vec<CompiledStatement>, CompileError> {
    let mark = ctx.local_mark();
    let compiled = body
        .iter()
        .map(|statement| statement.compile(ctx))
        .collect::<Result<Vec<_>, _>>();
    ctx.truncate_locals(mark);
    compiled
}

impl Statement {
    pub fn compile(&self, ctx: &mut CompileContext<'_>) -> Result<CompiledStatement, CompileError> {
        let kind = match self {
            Self::Set { var, value } => {
                let value = value.compile(ctx)?;
                let (target, expected) = if let Some(ty) = ctx.local_type(var) {
                    (SetTarget::Local(var.clone()), ty)
                } else {
                    match ctx.lookup_variable(var) {
                        Some((0, ty)) => (SetTarget::Own(var.clone()), ty),
                        Some((levels, ty)) => (
                            SetTarget::Host {
                                levels,
                                name: var.clone(),
                            },
                            ty,
                        ),
                        None => {
                            return Err(CompileError::UnknownVariable {
                                species: ctx.current_species().name().to_string(),
                                name: var.clone(),
                            });
                        }
                    }
                };
                check_assignable(var, expected, value.value_type())?;
                StatementKind::Set { target, value }
            }
            Self::Let { name, value } => {
                let value = value.compile(ctx)?;
                ctx.declare_local(name, value.value_type());
                StatementKind::Let {
                    name: name.clone(),
                    value,
                }
            }
            Self::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = cond.compile(ctx)?;
                check_assignable("if", ValueType::Bool, cond.value_type())?;
                StatementKind::If {
                    cond,
                    then: compile_block(then, ctx)?,
                    otherwise: compile_block(otherwise, ctx)?,
                }
            }
            Self::Loop { times, body } => {
                let times = times.compile(ctx)?;
                check_assignable("times", ValueType::Float, times.value_type())?;
                StatementKind::Loop {
                    times,
                    body: compile_block(body, ctx)?,
                }
            }
            Self::Create {
                species,
                count,
                with,
                bind,
            } => {
                let (target, target_id) = resolve_create_target(species, ctx)?;
                let count = compile_optional(count.as_ref(), ctx)?;
                if let Some(count) = &count {
                    check_assignable("count", ValueType::Int, count.value_type())?;
                }
                let target_species = ctx.species(target_id);
                let with = with
                    .iter()
                    .map(|init| {
                        let value = init.value.compile(ctx)?;
                        let expected = target_species.variable_type(&init.var).ok_or_else(|| {
                            CompileError::UnknownVariable {
                                species: target_species.name().to_string(),
                                name: init.var.clone(),
                            }
                        })?;
                        check_assignable(&init.var, expected, value.value_type())?;
                        Ok((init.var.clone(), value))
                    })
                    .collect::<Result<Vec<_>, CompileError>>()?;
                if let Some(bind) = bind {
                    ctx.declare_local(bind, ValueType::List);
                }
                StatementKind::Create {
                    target,
                    count,
                    with,
                    bind: bind.clone(),
                }
            }
            Self::Die => StatementKind::Die,
            Self::Ask {
                target,
                species,
                body,
            } => {
                let target = target.compile(ctx)?;
                let species_id = ctx
                    .species
                    .iter()
                    .find(|candidate| candidate.name() == species)
                    .map(|candidate| candidate.id())
                    .ok_or_else(|| CompileError::UnknownSpecies(species.clone()))?;
                let mut nested = ctx.nested(species_id, Some(ctx.current));
                StatementKind::Ask {
                    target,
                    species: species_id,
                    body: compile_block(body, &mut nested)?,
                }
            }
            Self::Do { action, args } => {
                let species = ctx.current_species();
                let action = species
                    .action(action)
                    .cloned()
                    .ok_or_else(|| CompileError::UnknownAction {
                        species: species.name().to_string(),
                        action: action.clone(),
                    })?;
                let args = args
                    .iter()
                    .map(|(name, expr)| Ok((name.clone(), expr.compile(ctx)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                StatementKind::Do { action, args }
            }
            Self::Socialize {
                agent,
                appreciation,
                dominance,
                solidarity,
                familiarity,
                when,
            } => {
                let caller = ctx.caller.ok_or(CompileError::MissingCaller("socialize"))?;
                let caller_species = ctx.species(caller);
                if !caller_species.has_skill(SOCIAL_SKILL) {
                    return Err(CompileError::MissingSocialSkill(
                        caller_species.name().to_string(),
                    ));
                }
                let when = compile_optional(when.as_ref(), ctx)?;
                // Facets run as the caller, with the current agent as `myself`.
                let as_caller = ctx.nested(caller, Some(ctx.current));
                let facets = SocialFacets {
                    agent: compile_optional(agent.as_ref(), &as_caller)?,
                    appreciation: compile_optional(appreciation.as_ref(), &as_caller)?,
                    dominance: compile_optional(dominance.as_ref(), &as_caller)?,
                    solidarity: compile_optional(solidarity.as_ref(), &as_caller)?,
                    familiarity: compile_optional(familiarity.as_ref(), &as_caller)?,
                };
                StatementKind::Socialize {
                    facets: Box::new(facets),
                    when,
                }
            }
        };
        Ok(CompiledStatement { kind })
    }
}

fn resolve_create_target(
    species: &str,
    ctx: &CompileContext<'_>,
) -> Result<(CreateTarget, SpeciesId), CompileError> {
    let mut levels = 0;
    let mut cursor = Some(ctx.current);
    while let Some(id) = cursor {
        let host = ctx.species(id);
        if let Some(micro) = host
            .micro_species()
            .iter()
            .copied()
            .find(|micro| ctx.species(*micro).name() == species)
        {
            return Ok((
                CreateTarget::Micro {
                    host_levels: levels,
                    species: micro,
                },
                micro,
            ));
        }
        cursor = host.host();
        levels += 1;
    }
    ctx.species
        .iter()
        .find(|candidate| candidate.is_builtin() && candidate.name() == species)
        .map(|candidate| (CreateTarget::Builtin(species.to_string()), candidate.id()))
        .ok_or_else(|| CompileError::UnknownSpecies(species.to_string()))
}

/// Execute statements in order, stopping early if the agent halts.
pub fn execute_block(
    body: &[CompiledStatement],
    sim: &mut Simulation,
    scope: &mut Scope,
) -> Result<Flow, EvalError> {
    for statement in body {
        if statement.execute(sim, scope)? == Flow::Halt {
            return Ok(Flow::Halt);
        }
    }
    Ok(Flow::Continue)
}

/// Run `body` in a copy of `scope` with `agent` pushed; the copy is
/// released on every path.
fn run_as(
    agent: AgentId,
    purpose: &str,
    body: &[CompiledStatement],
    sim: &mut Simulation,
    scope: &mut Scope,
) -> Result<Flow, EvalError> {
    let mut frame = scope.copy(purpose)?;
    frame.push(agent);
    let result = execute_block(body, sim, &mut frame);
    frame.release();
    result
}

fn agents_of(value: Value) -> Result<Vec<AgentId>, EvalError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Agent(agent) => Ok(vec![agent]),
        Value::List(items) => items
            .iter()
            .filter(|item| !item.is_nil())
            .map(|item| {
                item.as_agent().ok_or(EvalError::TypeMismatch {
                    expected: ValueType::Agent,
                    found: item.value_type(),
                })
            })
            .collect(),
        other => Err(EvalError::TypeMismatch {
            expected: ValueType::Agent,
            found: other.value_type(),
        }),
    }
}

fn facet(
    expr: Option<&CompiledExpr>,
    sim: &Simulation,
    scope: &mut Scope,
) -> Result<Value, EvalError> {
    let Some(expr) = expr else {
        return Ok(Value::Float(0.0));
    };
    match expr.evaluate(sim, scope)? {
        Value::Nil => Ok(Value::Float(0.0)),
        value => value
            .as_float()
            .map(Value::Float)
            .ok_or(EvalError::TypeMismatch {
                expected: ValueType::Float,
                found: value.value_type(),
            }),
    }
}

impl CompiledStatement {
    pub fn execute(&self, sim: &mut Simulation, scope: &mut Scope) -> Result<Flow, EvalError> {
        match &self.kind {
            StatementKind::Set { target, value } => {
                let value = value.evaluate(sim, scope)?;
                match target {
                    SetTarget::Local(name) => scope.bind_local(name.clone(), value),
                    SetTarget::Own(name) => sim.set_variable(scope.current_agent()?, name, value)?,
                    SetTarget::Host { levels, name } => {
                        let host = sim.ancestor(scope.current_agent()?, *levels)?;
                        sim.set_variable(host, name, value)?;
                    }
                }
                Ok(Flow::Continue)
            }
            StatementKind::Let { name, value } => {
                let value = value.evaluate(sim, scope)?;
                scope.bind_local(name.clone(), value);
                Ok(Flow::Continue)
            }
            StatementKind::If {
                cond,
                then,
                otherwise,
            } => {
                if cond.evaluate(sim, scope)?.as_bool() {
                    execute_block(then, sim, scope)
                } else {
                    execute_block(otherwise, sim, scope)
                }
            }
            StatementKind::Loop { times, body } => {
                let value = times.evaluate(sim, scope)?;
                let times = value.as_int().ok_or(EvalError::TypeMismatch {
                    expected: ValueType::Int,
                    found: value.value_type(),
                })?;
                for _ in 0..times.max(0) {
                    if execute_block(body, sim, scope)? == Flow::Halt {
                        return Ok(Flow::Halt);
                    }
                }
                Ok(Flow::Continue)
            }
            StatementKind::Create {
                target,
                count,
                with,
                bind,
            } => {
                let count = match count {
                    Some(expr) => expr.evaluate(sim, scope)?.as_int().unwrap_or(0).max(0) as usize,
                    None => 1,
                };
                let population = match target {
                    CreateTarget::Micro {
                        host_levels,
                        species,
                    } => {
                        let host = sim.ancestor(scope.current_agent()?, *host_levels)?;
                        sim.micro_population(host, *species)?
                    }
                    CreateTarget::Builtin(name) => sim.population_for(name)?,
                };
                let mut initial_values = Vec::new();
                if !with.is_empty() {
                    for _ in 0..count {
                        let mut values = BTreeMap::new();
                        for (var, expr) in with {
                            values.insert(var.clone(), expr.evaluate(sim, scope)?);
                        }
                        initial_values.push(values);
                    }
                }
                let created = sim.create_agents(scope, population, count, &initial_values, false)?;
                if let Some(bind) = bind {
                    scope.bind_local(
                        bind.clone(),
                        Value::List(created.into_iter().map(Value::Agent).collect()),
                    );
                }
                Ok(Flow::Continue)
            }
            StatementKind::Die => {
                sim.kill(scope.current_agent()?)?;
                Ok(Flow::Halt)
            }
            StatementKind::Ask {
                target,
                species,
                body,
            } => {
                let targets = agents_of(target.evaluate(sim, scope)?)?;
                for agent in targets {
                    if !sim.is_active(agent) {
                        continue;
                    }
                    if !sim.is_kind_of(agent, *species)? {
                        return Err(EvalError::WrongSpecies {
                            agent: sim.agent_label(agent),
                            species: sim.model().species(*species).name().to_string(),
                        });
                    }
                    run_as(agent, "ask", body, sim, scope)?;
                }
                Ok(Flow::Continue)
            }
            StatementKind::Do { action, args } => {
                let agent = scope.current_agent()?;
                let mut values = BTreeMap::new();
                for (name, expr) in args {
                    values.insert(name.clone(), expr.evaluate(sim, scope)?);
                }
                (action.handler)(&mut ActionContext {
                    sim,
                    scope,
                    agent,
                    args: &values,
                })?;
                Ok(if sim.is_active(agent) {
                    Flow::Continue
                } else {
                    Flow::Halt
                })
            }
            StatementKind::Socialize { facets, when } => {
                let caller = scope.myself()?;
                let current = scope.current_agent()?;
                if let Some(when) = when
                    && !when.evaluate(sim, scope)?.as_bool()
                {
                    return Ok(Flow::Continue);
                }
                let mut as_caller = scope.copy("socialize")?;
                as_caller.push(caller);
                let link = socialize_link(facets, current, sim, &mut as_caller);
                as_caller.release();
                let link = link?;
                let mut links = sim
                    .variable(caller, SOCIAL_LINKS)?
                    .as_list()
                    .map(<[Value]>::to_vec)
                    .unwrap_or_default();
                let peer = link.get("agent").cloned();
                let link = Value::Map(link);
                match links.iter_mut().find(|existing| match existing {
                    Value::Map(entries) => entries.get("agent").cloned() == peer,
                    _ => false,
                }) {
                    Some(existing) => *existing = link,
                    None => links.push(link),
                }
                sim.set_variable(caller, SOCIAL_LINKS, Value::List(links))?;
                Ok(Flow::Continue)
            }
        }
    }
}

fn socialize_link(
    facets: &SocialFacets,
    current: AgentId,
    sim: &Simulation,
    scope: &mut Scope,
) -> Result<BTreeMap<String, Value>, EvalError> {
    let agent = match &facets.agent {
        Some(expr) => expr.evaluate(sim, scope)?,
        None => Value::Agent(current),
    };
    let mut link = BTreeMap::new();
    link.insert("agent".to_string(), agent);
    link.insert(
        "appreciation".to_string(),
        facet(facets.appreciation.as_ref(), sim, scope)?,
    );
    link.insert(
        "dominance".to_string(),
        facet(facets.dominance.as_ref(), sim, scope)?,
    );
    link.insert(
        "solidarity".to_string(),
        facet(facets.solidarity.as_ref(), sim, scope)?,
    );
    link.insert(
        "familiarity".to_string(),
        facet(facets.familiarity.as_ref(), sim, scope)?,
    );
    Ok(link)
}
