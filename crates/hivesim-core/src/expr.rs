//! Expression syntax trees, their compilation and evaluation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, EvalError};
use crate::registry::{OpContext, OperatorFn, Registry};
use crate::scope::Scope;
use crate::simulation::Simulation;
use crate::species::{Species, SpeciesId};
use crate::value::{Value, ValueType};

/// Parsed expression, as produced by the model parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Lit(Value),
    Var(String),
    #[serde(rename = "self")]
    SelfRef,
    Myself,
    World,
    Attr {
        target: Box<Expr>,
        name: String,
    },
    Call {
        op: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    List(Vec<Expr>),
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Self::Lit(value.into())
    }

    pub fn var(name: &str) -> Self {
        Self::Var(name.to_string())
    }

    pub fn call(op: &str, args: Vec<Expr>) -> Self {
        Self::Call {
            op: op.to_string(),
            args,
        }
    }

    pub fn attr(target: Expr, name: &str) -> Self {
        Self::Attr {
            target: Box::new(target),
            name: name.to_string(),
        }
    }

    /// Compile against the registry and the variable tables in `ctx`.
    pub fn compile(&self, ctx: &CompileContext<'_>) -> Result<CompiledExpr, CompileError> {
        match self {
            Self::Lit(value) => Ok(CompiledExpr::constant(value.clone())),
            Self::Var(name) => ctx.variable(name),
            Self::SelfRef => Ok(CompiledExpr::new(ExprKind::SelfRef, ValueType::Agent)),
            Self::Myself => {
                if ctx.caller.is_none() {
                    return Err(CompileError::MissingCaller("myself"));
                }
                Ok(CompiledExpr::new(ExprKind::Myself, ValueType::Agent))
            }
            Self::World => Ok(CompiledExpr::new(ExprKind::World, ValueType::Agent)),
            Self::Attr { target, name } => {
                let target_species = match target.as_ref() {
                    Self::World => Some(SpeciesId::WORLD),
                    Self::SelfRef => Some(ctx.current),
                    Self::Myself => ctx.caller,
                    _ => None,
                };
                let target = target.compile(ctx)?;
                if !ValueType::Agent.accepts(target.ty) && target.ty != ValueType::Any {
                    return Err(CompileError::TypeMismatch {
                        name: name.clone(),
                        expected: ValueType::Agent,
                        found: target.ty,
                    });
                }
                let ty = match target_species {
                    Some(id) => {
                        let species = ctx.species(id);
                        species.variable_type(name).ok_or_else(|| {
                            CompileError::UnknownVariable {
                                species: species.name().to_string(),
                                name: name.clone(),
                            }
                        })?
                    }
                    None => ValueType::Any,
                };
                Ok(CompiledExpr::new(
                    ExprKind::Attr {
                        target: Box::new(target),
                        name: name.clone(),
                    },
                    ty,
                ))
            }
            Self::Call { op, args } => {
                let args = args
                    .iter()
                    .map(|arg| arg.compile(ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                let types: Vec<ValueType> = args.iter().map(|arg| arg.ty).collect();
                let entry = ctx.registry.resolve(op, &types)?;
                let dynamic = types
                    .iter()
                    .any(|ty| matches!(ty, ValueType::Any | ValueType::Nil));
                let (dispatch, ty) = if dynamic {
                    let candidates = ctx.registry.candidates(op, &types);
                    let ty = if candidates.iter().all(|c| c.returns == entry.returns) {
                        entry.returns
                    } else {
                        ValueType::Any
                    };
                    (Dispatch::Dynamic, ty)
                } else {
                    (Dispatch::Static(entry.handler.clone()), entry.returns)
                };
                Ok(CompiledExpr::new(
                    ExprKind::Call {
                        keyword: op.clone(),
                        dispatch,
                        args,
                    },
                    ty,
                ))
            }
            Self::List(items) => {
                let items = items
                    .iter()
                    .map(|item| item.compile(ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledExpr::new(ExprKind::List(items), ValueType::List))
            }
            Self::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = cond.compile(ctx)?;
                if !ValueType::Bool.accepts(cond.ty) && cond.ty != ValueType::Any {
                    return Err(CompileError::TypeMismatch {
                        name: "if".into(),
                        expected: ValueType::Bool,
                        found: cond.ty,
                    });
                }
                let then = then.compile(ctx)?;
                let otherwise = otherwise.compile(ctx)?;
                let ty = if then.ty == otherwise.ty {
                    then.ty
                } else {
                    ValueType::Any
                };
                Ok(CompiledExpr::new(
                    ExprKind::If {
                        cond: Box::new(cond),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                    ty,
                ))
            }
        }
    }
}

/// Static environment used while compiling one species' behaviour.
pub struct CompileContext<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) species: &'a [Species],
    pub(crate) current: SpeciesId,
    pub(crate) caller: Option<SpeciesId>,
    locals: Vec<(String, ValueType)>,
}

impl<'a> CompileContext<'a> {
    pub(crate) fn new(registry: &'a Registry, species: &'a [Species], current: SpeciesId) -> Self {
        Self {
            registry,
            species,
            current,
            caller: None,
            locals: Vec::new(),
        }
    }

    /// Context for a nested frame running as `current`, called by `caller`.
    pub(crate) fn nested(&self, current: SpeciesId, caller: Option<SpeciesId>) -> Self {
        Self {
            registry: self.registry,
            species: self.species,
            current,
            caller,
            locals: self.locals.clone(),
        }
    }

    pub(crate) fn species(&self, id: SpeciesId) -> &'a Species {
        &self.species[id.0]
    }

    pub(crate) fn current_species(&self) -> &'a Species {
        self.species(self.current)
    }

    pub(crate) fn declare_local(&mut self, name: &str, ty: ValueType) {
        self.locals.push((name.to_string(), ty));
    }

    pub(crate) fn local_mark(&self) -> usize {
        self.locals.len()
    }

    pub(crate) fn truncate_locals(&mut self, mark: usize) {
        self.locals.truncate(mark);
    }

    pub(crate) fn local_type(&self, name: &str) -> Option<ValueType> {
        self.locals
            .iter()
            .rev()
            .find(|(local, _)| local == name)
            .map(|(_, ty)| *ty)
    }

    /// Walk the host chain from the current species.
    ///
    /// Returns how many hosts up the variable lives and its type.
    pub(crate) fn lookup_variable(&self, name: &str) -> Option<(usize, ValueType)> {
        let mut levels = 0;
        let mut cursor = Some(self.current);
        while let Some(id) = cursor {
            let species = self.species(id);
            if let Some(ty) = species.variable_type(name) {
                return Some((levels, ty));
            }
            cursor = species.host();
            levels += 1;
        }
        None
    }

    pub(crate) fn variable(&self, name: &str) -> Result<CompiledExpr, CompileError> {
        if let Some(ty) = self.local_type(name) {
            return Ok(CompiledExpr::new(ExprKind::Local(name.to_string()), ty));
        }
        match self.lookup_variable(name) {
            Some((0, ty)) => Ok(CompiledExpr::new(ExprKind::Own(name.to_string()), ty)),
            Some((levels, ty)) => Ok(CompiledExpr::new(
                ExprKind::Host {
                    levels,
                    name: name.to_string(),
                },
                ty,
            )),
            None => Err(CompileError::UnknownVariable {
                species: self.current_species().name().to_string(),
                name: name.to_string(),
            }),
        }
    }
}

#[derive(Clone)]
enum Dispatch {
    Static(OperatorFn),
    /// Re-resolved against the runtime argument types.
    Dynamic,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("Static"),
            Self::Dynamic => f.write_str("Dynamic"),
        }
    }
}

#[derive(Debug, Clone)]
enum ExprKind {
    Const(Value),
    Local(String),
    Own(String),
    Host {
        levels: usize,
        name: String,
    },
    SelfRef,
    Myself,
    World,
    Attr {
        target: Box<CompiledExpr>,
        name: String,
    },
    Call {
        keyword: String,
        dispatch: Dispatch,
        args: Vec<CompiledExpr>,
    },
    List(Vec<CompiledExpr>),
    If {
        cond: Box<CompiledExpr>,
        then: Box<CompiledExpr>,
        otherwise: Box<CompiledExpr>,
    },
}

/// Expression with resolved variables and operators, ready to evaluate.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    kind: ExprKind,
    ty: ValueType,
}

impl CompiledExpr {
    fn new(kind: ExprKind, ty: ValueType) -> Self {
        Self { kind, ty }
    }

    #[must_use]
    pub fn constant(value: Value) -> Self {
        let ty = value.value_type();
        Self::new(ExprKind::Const(value), ty)
    }

    /// Static type computed at compile time.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        self.ty
    }

    pub fn evaluate(&self, sim: &Simulation, scope: &mut Scope) -> Result<Value, EvalError> {
        scope.ensure_usable()?;
        match &self.kind {
            ExprKind::Const(value) => Ok(value.clone()),
            ExprKind::Local(name) => scope
                .resolve_local(name)
                .cloned()
                .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
            ExprKind::Own(name) => sim.variable(scope.current_agent()?, name),
            ExprKind::Host { levels, name } => {
                let host = sim.ancestor(scope.current_agent()?, *levels)?;
                sim.variable(host, name)
            }
            ExprKind::SelfRef => scope.current_agent().map(Value::Agent),
            ExprKind::Myself => scope.myself().map(Value::Agent),
            ExprKind::World => sim
                .world()
                .map(Value::Agent)
                .ok_or_else(|| EvalError::AgentUnavailable("world".into())),
            ExprKind::Attr { target, name } => {
                let target = target.evaluate(sim, scope)?;
                let agent = target.as_agent().ok_or(EvalError::TypeMismatch {
                    expected: ValueType::Agent,
                    found: target.value_type(),
                })?;
                sim.variable(agent, name)
            }
            ExprKind::Call {
                keyword,
                dispatch,
                args,
            } => {
                let values = args
                    .iter()
                    .map(|arg| arg.evaluate(sim, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                let handler = match dispatch {
                    Dispatch::Static(handler) => handler,
                    Dispatch::Dynamic => {
                        let types: Vec<ValueType> =
                            values.iter().map(Value::value_type).collect();
                        &sim.registry().resolve(keyword, &types)?.handler
                    }
                };
                handler(&mut OpContext { sim, scope }, &values)
            }
            ExprKind::List(items) => items
                .iter()
                .map(|item| item.evaluate(sim, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                if cond.evaluate(sim, scope)?.as_bool() {
                    then.evaluate(sim, scope)
                } else {
                    otherwise.evaluate(sim, scope)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape_of_expressions() {
        let expr: Expr = serde_json::from_str(
            r#"{"call": {"op": ">=", "args": [{"var": "cycle"}, {"lit": 3}]}}"#,
        )
        .expect("parse");
        assert_eq!(
            expr,
            Expr::call(">=", vec![Expr::var("cycle"), Expr::lit(3_i64)])
        );
        let reference: Expr = serde_json::from_str(r#"{"attr": {"target": "myself", "name": "energy"}}"#)
            .expect("parse");
        assert_eq!(reference, Expr::attr(Expr::Myself, "energy"));
        let world: Expr = serde_json::from_str(r#""self""#).expect("parse");
        assert_eq!(world, Expr::SelfRef);
    }
}
