//! Built-in language primitives: types, operators, species and skills.

use std::cmp::Ordering;
use std::sync::Arc;

use rand::Rng;

use crate::agent::AgentId;
use crate::error::EvalError;
use crate::geometry::Point;
use crate::registry::{
    ActionContext, ActionEntry, BuiltinVariable, Contributor, OpContext, RegistryBuilder,
    SkillEntry, SpeciesPrototype, SpeciesRole,
};
use crate::statement::{SOCIAL_LINKS, SOCIAL_SKILL};
use crate::value::{Value, ValueType};

/// Contributors run, in order, by [`crate::Registry::with_builtins`].
pub const CONTRIBUTORS: &[Contributor] = &[
    register_types,
    register_arithmetic,
    register_logic,
    register_random,
    register_spatial,
    register_collections,
    register_species,
    register_skills,
];

pub const WORLD_SPECIES: &str = "world";
pub const DEFAULT_SPECIES: &str = "agent";
pub const EXPERIMENTATOR_SPECIES: &str = "experimentator";
pub const MOVING_SKILL: &str = "moving";

fn mismatch(expected: ValueType, found: &Value) -> EvalError {
    EvalError::TypeMismatch {
        expected,
        found: found.value_type(),
    }
}

fn float(value: &Value) -> Result<f64, EvalError> {
    value.as_float().ok_or_else(|| mismatch(ValueType::Float, value))
}

fn int(value: &Value) -> Result<i64, EvalError> {
    match value {
        Value::Int(i) => Ok(*i),
        other => other.as_int().ok_or_else(|| mismatch(ValueType::Int, other)),
    }
}

fn point(value: &Value) -> Result<Point, EvalError> {
    value.as_point().ok_or_else(|| mismatch(ValueType::Point, value))
}

fn boolean(value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(mismatch(ValueType::Bool, other)),
    }
}

/// Equality where ints and floats compare numerically.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        _ => a.as_float()?.partial_cmp(&b.as_float()?),
    }
}

fn register_types(builder: &mut RegistryBuilder) {
    for ty in [
        ValueType::Bool,
        ValueType::Int,
        ValueType::Float,
        ValueType::String,
        ValueType::Point,
        ValueType::Agent,
        ValueType::List,
        ValueType::Map,
        ValueType::Image,
        ValueType::Any,
    ] {
        builder.type_keyword(ty);
    }
}

fn register_arithmetic(builder: &mut RegistryBuilder) {
    use ValueType::{Any, Float, Int, List, Point as Pt, String as Str};

    builder
        .operator("+", &[Int, Int], Int, |_, a| {
            Ok(Value::Int(int(&a[0])?.wrapping_add(int(&a[1])?)))
        })
        .operator("+", &[Float, Float], Float, |_, a| {
            Ok(Value::Float(float(&a[0])? + float(&a[1])?))
        })
        .operator("+", &[Pt, Pt], Pt, |_, a| {
            let (p, q) = (point(&a[0])?, point(&a[1])?);
            Ok(Value::Point(p.translated(q.x, q.y)))
        })
        .operator("+", &[Str, Any], Str, |_, a| {
            Ok(Value::String(format!("{}{}", a[0], a[1])))
        })
        .operator("+", &[List, Any], List, |_, a| {
            let mut items = a[0].as_list().map(<[Value]>::to_vec).unwrap_or_default();
            match &a[1] {
                Value::List(more) => items.extend(more.iter().cloned()),
                other => items.push(other.clone()),
            }
            Ok(Value::List(items))
        })
        .operator("-", &[Int, Int], Int, |_, a| {
            Ok(Value::Int(int(&a[0])?.wrapping_sub(int(&a[1])?)))
        })
        .operator("-", &[Float, Float], Float, |_, a| {
            Ok(Value::Float(float(&a[0])? - float(&a[1])?))
        })
        .operator("-", &[Pt, Pt], Pt, |_, a| {
            let (p, q) = (point(&a[0])?, point(&a[1])?);
            Ok(Value::Point(p.translated(-q.x, -q.y)))
        })
        .operator("-", &[Int], Int, |_, a| Ok(Value::Int(int(&a[0])?.wrapping_neg())))
        .operator("-", &[Float], Float, |_, a| Ok(Value::Float(-float(&a[0])?)))
        .operator("*", &[Int, Int], Int, |_, a| {
            Ok(Value::Int(int(&a[0])?.wrapping_mul(int(&a[1])?)))
        })
        .operator("*", &[Float, Float], Float, |_, a| {
            Ok(Value::Float(float(&a[0])? * float(&a[1])?))
        })
        .operator("*", &[Pt, Float], Pt, |_, a| {
            let (p, k) = (point(&a[0])?, float(&a[1])?);
            Ok(Value::Point(Point::new(p.x * k, p.y * k)))
        })
        .operator("/", &[Float, Float], Float, |_, a| {
            let divisor = float(&a[1])?;
            if divisor == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok(Value::Float(float(&a[0])? / divisor))
        })
        .operator("%", &[Int, Int], Int, |_, a| {
            int(&a[0])?
                .checked_rem(int(&a[1])?)
                .map(Value::Int)
                .ok_or(EvalError::DivisionByZero)
        })
        .operator("abs", &[Int], Int, |_, a| Ok(Value::Int(int(&a[0])?.wrapping_abs())))
        .operator("abs", &[Float], Float, |_, a| Ok(Value::Float(float(&a[0])?.abs())))
        .operator("sqrt", &[Float], Float, |_, a| Ok(Value::Float(float(&a[0])?.sqrt())))
        .operator("min", &[Int, Int], Int, |_, a| Ok(Value::Int(int(&a[0])?.min(int(&a[1])?))))
        .operator("min", &[Float, Float], Float, |_, a| {
            Ok(Value::Float(float(&a[0])?.min(float(&a[1])?)))
        })
        .operator("max", &[Int, Int], Int, |_, a| Ok(Value::Int(int(&a[0])?.max(int(&a[1])?))))
        .operator("max", &[Float, Float], Float, |_, a| {
            Ok(Value::Float(float(&a[0])?.max(float(&a[1])?)))
        });
}

fn register_logic(builder: &mut RegistryBuilder) {
    use ValueType::{Any, Bool, Float, Int};

    for (keyword, accept) in [
        ("<", Ordering::is_lt as fn(Ordering) -> bool),
        ("<=", Ordering::is_le),
        (">", Ordering::is_gt),
        (">=", Ordering::is_ge),
    ] {
        for ty in [Int, Float] {
            builder.operator(keyword, &[ty, ty], Bool, move |_, a| {
                compare_numbers(&a[0], &a[1])
                    .map(|ordering| Value::Bool(accept(ordering)))
                    .ok_or_else(|| mismatch(Float, if a[0].as_float().is_none() { &a[0] } else { &a[1] }))
            });
        }
    }
    builder
        .operator("==", &[Any, Any], Bool, |_, a| Ok(Value::Bool(values_equal(&a[0], &a[1]))))
        .operator("!=", &[Any, Any], Bool, |_, a| Ok(Value::Bool(!values_equal(&a[0], &a[1]))))
        .operator("and", &[Bool, Bool], Bool, |_, a| Ok(Value::Bool(boolean(&a[0])? && boolean(&a[1])?)))
        .operator("or", &[Bool, Bool], Bool, |_, a| Ok(Value::Bool(boolean(&a[0])? || boolean(&a[1])?)))
        .operator("not", &[Bool], Bool, |_, a| Ok(Value::Bool(!boolean(&a[0])?)));
}

fn register_random(builder: &mut RegistryBuilder) {
    use ValueType::{Bool, Float, Int};

    builder
        .operator("rnd", &[Int], Int, |ctx, a| {
            let bound = int(&a[0])?;
            let (lo, hi) = if bound < 0 { (bound, 0) } else { (0, bound) };
            Ok(Value::Int(ctx.scope.rng().random_range(lo..=hi)))
        })
        .operator("rnd", &[Int, Int], Int, |ctx, a| {
            let (x, y) = (int(&a[0])?, int(&a[1])?);
            Ok(Value::Int(ctx.scope.rng().random_range(x.min(y)..=x.max(y))))
        })
        .operator("rnd", &[Float], Float, |ctx, a| {
            let bound = float(&a[0])?;
            Ok(Value::Float(ctx.scope.rng().random::<f64>() * bound))
        })
        .operator("flip", &[Float], Bool, |ctx, a| {
            let probability = float(&a[0])?;
            Ok(Value::Bool(ctx.scope.rng().random::<f64>() < probability))
        });
}

fn agent_arg(value: &Value) -> Result<AgentId, EvalError> {
    value.as_agent().ok_or_else(|| mismatch(ValueType::Agent, value))
}

fn agents_list(agents: Vec<AgentId>) -> Value {
    Value::List(agents.into_iter().map(Value::Agent).collect())
}

fn register_spatial(builder: &mut RegistryBuilder) {
    use ValueType::{Agent, Float, List, Point as Pt, String as Str};

    builder
        .operator("point", &[Float, Float], Pt, |_, a| {
            Ok(Value::Point(Point::new(float(&a[0])?, float(&a[1])?)))
        })
        .operator("distance_to", &[Pt, Pt], Float, |ctx, a| {
            Ok(Value::Float(ctx.sim.environment().distance(point(&a[0])?, point(&a[1])?)))
        })
        .operator("distance_to", &[Agent, Agent], Float, |ctx, a| {
            let from = ctx.sim.location(agent_arg(&a[0])?)?;
            let to = ctx.sim.location(agent_arg(&a[1])?)?;
            Ok(Value::Float(ctx.sim.environment().distance(from, to)))
        })
        .operator("agents_at_distance", &[Float], List, |ctx: &mut OpContext<'_>, a| {
            let agent = ctx.scope.current_agent()?;
            Ok(agents_list(ctx.sim.neighbors(agent, float(&a[0])?)?))
        })
        .operator("neighbors_of", &[Agent, Float], List, |ctx, a| {
            Ok(agents_list(ctx.sim.neighbors(agent_arg(&a[0])?, float(&a[1])?)?))
        })
        .operator("population", &[Str], List, |ctx, a| {
            let Value::String(name) = &a[0] else {
                return Err(mismatch(Str, &a[0]));
            };
            Ok(agents_list(ctx.sim.population_agents(name)))
        })
        .operator("agent_at", &[Str, Pt], Agent, |ctx, a| {
            let Value::String(name) = &a[0] else {
                return Err(mismatch(Str, &a[0]));
            };
            let location = point(&a[1])?;
            Ok(ctx
                .sim
                .population_named(name)
                .and_then(|population| ctx.sim.agent_at(population, location))
                .map_or(Value::Nil, Value::Agent))
        })
        .operator("dead", &[Agent], ValueType::Bool, |ctx, a| {
            Ok(Value::Bool(match &a[0] {
                Value::Agent(agent) => !ctx.sim.is_active(*agent),
                _ => true,
            }))
        });
}

fn register_collections(builder: &mut RegistryBuilder) {
    use ValueType::{Any, Bool, Int, List, Map, String as Str};

    builder
        .operator("length", &[List], Int, |_, a| {
            Ok(Value::Int(a[0].as_list().map_or(0, <[Value]>::len) as i64))
        })
        .operator("length", &[Str], Int, |_, a| match &a[0] {
            Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
            other => Err(mismatch(Str, other)),
        })
        .operator("length", &[Map], Int, |_, a| match &a[0] {
            Value::Map(entries) => Ok(Value::Int(entries.len() as i64)),
            other => Err(mismatch(Map, other)),
        })
        .operator("contains", &[List, Any], Bool, |_, a| {
            Ok(Value::Bool(
                a[0].as_list()
                    .is_some_and(|items| items.iter().any(|item| values_equal(item, &a[1]))),
            ))
        })
        .operator("min", &[List], Any, |_, a| Ok(extreme(&a[0], Ordering::Less)))
        .operator("max", &[List], Any, |_, a| Ok(extreme(&a[0], Ordering::Greater)));
}

fn extreme(list: &Value, wanted: Ordering) -> Value {
    list.as_list()
        .into_iter()
        .flatten()
        .filter(|item| item.as_float().is_some())
        .fold(None::<&Value>, |best, item| match best {
            Some(current) if compare_numbers(item, current) != Some(wanted) => Some(current),
            _ => Some(item),
        })
        .cloned()
        .unwrap_or(Value::Nil)
}

fn register_species(builder: &mut RegistryBuilder) {
    builder
        .species(SpeciesPrototype {
            name: WORLD_SPECIES.to_string(),
            role: Some(SpeciesRole::World),
            variables: vec![
                BuiltinVariable::new("cycle", ValueType::Int, Value::Int(0)),
                BuiltinVariable::new("seed", ValueType::Int, Value::Int(0)),
            ],
            skills: Vec::new(),
        })
        .species(SpeciesPrototype {
            name: DEFAULT_SPECIES.to_string(),
            role: Some(SpeciesRole::Default),
            variables: vec![
                BuiltinVariable::new("name", ValueType::String, Value::String(String::new())),
                BuiltinVariable::new("location", ValueType::Point, Value::Point(Point::default())),
            ],
            skills: Vec::new(),
        })
        .species(SpeciesPrototype {
            name: EXPERIMENTATOR_SPECIES.to_string(),
            role: Some(SpeciesRole::Experimentator),
            variables: vec![
                BuiltinVariable::new("seed", ValueType::Int, Value::Int(0)),
                BuiltinVariable::new(
                    "experiment_name",
                    ValueType::String,
                    Value::String(String::new()),
                ),
            ],
            skills: Vec::new(),
        });
}

fn action<F>(name: &str, args: &[(&str, ValueType)], handler: F) -> ActionEntry
where
    F: Fn(&mut ActionContext<'_>) -> Result<Value, EvalError> + Send + Sync + 'static,
{
    ActionEntry {
        name: name.to_string(),
        args: args.iter().map(|(arg, ty)| ((*arg).to_string(), *ty)).collect(),
        returns: ValueType::Nil,
        handler: Arc::new(handler),
    }
}

fn own_float(ctx: &ActionContext<'_>, name: &str) -> Result<f64, EvalError> {
    let value = ctx.sim.variable(ctx.agent, name)?;
    float(&value)
}

/// Move `distance` along `heading` (degrees) and remember the heading.
fn advance(ctx: &mut ActionContext<'_>, distance: f64, heading: f64) -> Result<Value, EvalError> {
    let location = ctx.sim.location(ctx.agent)?;
    let radians = heading.to_radians();
    let target = location.translated(distance * radians.cos(), distance * radians.sin());
    ctx.sim.set_location(ctx.agent, target)?;
    ctx.sim
        .set_variable(ctx.agent, "heading", Value::Float(heading))?;
    Ok(Value::Nil)
}

fn move_action(ctx: &mut ActionContext<'_>) -> Result<Value, EvalError> {
    let speed = match ctx.float_arg("speed")? {
        Some(speed) => speed,
        None => own_float(ctx, "speed")?,
    };
    let heading = match ctx.float_arg("heading")? {
        Some(heading) => heading,
        None => own_float(ctx, "heading")?,
    };
    advance(ctx, speed, heading)
}

fn wander_action(ctx: &mut ActionContext<'_>) -> Result<Value, EvalError> {
    let speed = match ctx.float_arg("speed")? {
        Some(speed) => speed,
        None => own_float(ctx, "speed")?,
    };
    let amplitude = ctx.float_arg("amplitude")?.unwrap_or(90.0).abs();
    let turn = ctx
        .scope
        .rng()
        .random_range(-amplitude / 2.0..=amplitude / 2.0);
    let heading = (own_float(ctx, "heading")? + turn).rem_euclid(360.0);
    advance(ctx, speed, heading)
}

fn goto_action(ctx: &mut ActionContext<'_>) -> Result<Value, EvalError> {
    let target = match ctx.arg("target") {
        Some(Value::Point(point)) => *point,
        Some(Value::Agent(agent)) => ctx.sim.location(*agent)?,
        Some(other) => return Err(mismatch(ValueType::Point, other)),
        None => return Ok(Value::Nil),
    };
    let speed = match ctx.float_arg("speed")? {
        Some(speed) => speed,
        None => own_float(ctx, "speed")?,
    };
    let location = ctx.sim.location(ctx.agent)?;
    let remaining = ctx.sim.environment().distance(location, target);
    if remaining <= speed {
        ctx.sim.set_location(ctx.agent, target)?;
        return Ok(Value::Nil);
    }
    let heading = (target.y - location.y)
        .atan2(target.x - location.x)
        .to_degrees();
    advance(ctx, speed, heading)
}

fn register_skills(builder: &mut RegistryBuilder) {
    use ValueType::{Any, Float};

    builder
        .skill(SkillEntry {
            name: MOVING_SKILL.to_string(),
            variables: vec![
                BuiltinVariable::new("speed", Float, Value::Float(1.0)),
                BuiltinVariable::new("heading", Float, Value::Float(0.0)),
            ],
            actions: vec![
                action("move", &[("speed", Float), ("heading", Float)], move_action),
                action("wander", &[("speed", Float), ("amplitude", Float)], wander_action),
                action("goto", &[("target", Any), ("speed", Float)], goto_action),
            ],
        })
        .skill(SkillEntry {
            name: SOCIAL_SKILL.to_string(),
            variables: vec![BuiltinVariable::new(
                SOCIAL_LINKS,
                ValueType::List,
                Value::List(Vec::new()),
            )],
            actions: Vec::new(),
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PrimitiveKind, Registry};

    #[test]
    fn builtin_registry_has_every_category() {
        let registry = Registry::with_builtins();
        assert!(registry.count(PrimitiveKind::Operator) > 30);
        assert_eq!(registry.type_named("float"), Ok(ValueType::Float));
        assert!(registry.is_builtin_species(DEFAULT_SPECIES));
        assert_eq!(
            registry.slot(SpeciesRole::Experimentator).map(|p| p.name.as_str()),
            Some(EXPERIMENTATOR_SPECIES)
        );
        assert!(registry.skill(MOVING_SKILL).is_ok());
    }

    #[test]
    fn arithmetic_promotes_and_divides_as_float() {
        let registry = Registry::with_builtins();
        let plus = registry
            .resolve("+", &[ValueType::Int, ValueType::Float])
            .expect("plus");
        assert_eq!(plus.returns, ValueType::Float);
        let divide = registry
            .resolve("/", &[ValueType::Int, ValueType::Int])
            .expect("divide");
        assert_eq!(divide.returns, ValueType::Float);
        assert!(registry.resolve("and", &[ValueType::Int, ValueType::Bool]).is_err());
    }

    #[test]
    fn numeric_helpers() {
        assert!(values_equal(&Value::Int(2), &Value::Float(2.0)));
        assert!(!values_equal(&Value::from("2"), &Value::Int(2)));
        let list = Value::List(vec![Value::Int(4), Value::Float(1.5), Value::from("x"), Value::Int(9)]);
        assert_eq!(extreme(&list, Ordering::Less), Value::Float(1.5));
        assert_eq!(extreme(&list, Ordering::Greater), Value::Int(9));
        assert_eq!(extreme(&Value::List(Vec::new()), Ordering::Less), Value::Nil);
    }
}
