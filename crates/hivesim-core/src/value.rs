//! Runtime values and their static types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::agent::AgentId;
use crate::geometry::Point;

/// Static type attached to compiled expressions, variables and operator signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Any,
    Nil,
    Bool,
    Int,
    Float,
    String,
    Point,
    Agent,
    List,
    Map,
    Image,
}

impl ValueType {
    pub const ALL: [ValueType; 11] = [
        Self::Any,
        Self::Nil,
        Self::Bool,
        Self::Int,
        Self::Float,
        Self::String,
        Self::Point,
        Self::Agent,
        Self::List,
        Self::Map,
        Self::Image,
    ];

    /// Language keyword naming this type.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Nil => "nil",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Point => "point",
            Self::Agent => "agent",
            Self::List => "list",
            Self::Map => "map",
            Self::Image => "image",
        }
    }

    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.keyword() == keyword)
    }

    /// Whether a value of type `other` can be stored where `self` is expected.
    #[must_use]
    pub fn accepts(self, other: ValueType) -> bool {
        self == other
            || self == Self::Any
            || other == Self::Nil
            || (self == Self::Float && other == Self::Int)
    }

    /// Value a variable of this type holds before initialisation.
    #[must_use]
    pub fn default_value(self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::Int => Value::Int(0),
            Self::Float => Value::Float(0.0),
            Self::String => Value::String(String::new()),
            Self::Point => Value::Point(Point::default()),
            Self::List => Value::List(Vec::new()),
            Self::Map => Value::Map(BTreeMap::new()),
            Self::Any | Self::Nil | Self::Agent | Self::Image => Value::Nil,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// RGBA raster produced by display outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[u8; 4]>,
}

impl Raster {
    /// Raster filled with a single color.
    #[must_use]
    pub fn filled(width: u32, height: u32, color: [u8; 4]) -> Self {
        Self {
            width,
            height,
            pixels: vec![color; width as usize * height as usize],
        }
    }

    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    pub fn put(&mut self, x: u32, y: u32, color: [u8; 4]) {
        if x < self.width && y < self.height {
            let idx = (y * self.width + x) as usize;
            self.pixels[idx] = color;
        }
    }

    /// Flattened RGBA bytes, row-major.
    #[must_use]
    pub fn to_rgba_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flatten().copied().collect()
    }
}

/// Dynamically typed value manipulated by the evaluator.
///
/// Agent references and rasters only exist at runtime and are skipped by serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Point(Point),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    #[serde(skip)]
    Agent(AgentId),
    #[serde(skip)]
    Image(Arc<Raster>),
}

impl Value {
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Nil => ValueType::Nil,
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
            Self::String(_) => ValueType::String,
            Self::Point(_) => ValueType::Point,
            Self::List(_) => ValueType::List,
            Self::Map(_) => ValueType::Map,
            Self::Agent(_) => ValueType::Agent,
            Self::Image(_) => ValueType::Image,
        }
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Boolean cast: nil, zero, `"false"` and empty containers are false.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => s.eq_ignore_ascii_case("true"),
            Self::List(items) => !items.is_empty(),
            Self::Map(entries) => !entries.is_empty(),
            Self::Point(_) | Self::Agent(_) | Self::Image(_) => true,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(f.trunc() as i64),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_agent(&self) -> Option<AgentId> {
        match self {
            Self::Agent(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_point(&self) -> Option<Point> {
        match self {
            Self::Point(p) => Some(*p),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Convert to `ty`, promoting ints to floats and casting scalars where lossless enough.
    #[must_use]
    pub fn coerce(self, ty: ValueType) -> Option<Value> {
        if ty == ValueType::Any || self.value_type() == ty || self.is_nil() {
            return Some(self);
        }
        match ty {
            ValueType::Float => self.as_float().map(Value::Float),
            ValueType::Int => self.as_int().map(Value::Int),
            ValueType::Bool => Some(Value::Bool(self.as_bool())),
            ValueType::String => Some(Value::String(self.to_string())),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Point> for Value {
    fn from(value: Point) -> Self {
        Self::Point(value)
    }
}

impl From<AgentId> for Value {
    fn from(value: AgentId) -> Self {
        Self::Agent(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::String(s) => f.write_str(s),
            Self::Point(p) => write!(f, "{{{:?},{:?}}}", p.x, p.y),
            Self::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("[")?;
                for (idx, (key, item)) in entries.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{key}::{item}")?;
                }
                f.write_str("]")
            }
            Self::Agent(id) => write!(f, "agent{id:?}"),
            Self::Image(raster) => write!(f, "image({}x{})", raster.width, raster.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_cast_follows_truthiness_rules() {
        assert!(!Value::Nil.as_bool());
        assert!(!Value::Int(0).as_bool());
        assert!(Value::Float(0.5).as_bool());
        assert!(Value::from("TRUE").as_bool());
        assert!(!Value::from("yes").as_bool());
        assert!(!Value::List(Vec::new()).as_bool());
    }

    #[test]
    fn float_accepts_int_but_not_reverse() {
        assert!(ValueType::Float.accepts(ValueType::Int));
        assert!(!ValueType::Int.accepts(ValueType::Float));
        assert!(ValueType::Any.accepts(ValueType::Agent));
        assert_eq!(Value::Int(3).coerce(ValueType::Float), Some(Value::Float(3.0)));
        assert_eq!(Value::from("x").coerce(ValueType::Point), None);
    }

    #[test]
    fn untagged_serde_picks_narrowest_variant() {
        let values: Vec<Value> =
            serde_json::from_str(r#"[null, true, 4, 2.5, "hi", {"x": 1.0, "y": 2.0}, [1, 2]]"#)
                .expect("parse");
        assert_eq!(
            values,
            vec![
                Value::Nil,
                Value::Bool(true),
                Value::Int(4),
                Value::Float(2.5),
                Value::from("hi"),
                Value::Point(Point::new(1.0, 2.0)),
                Value::List(vec![Value::Int(1), Value::Int(2)]),
            ]
        );
    }

    #[test]
    fn keywords_roundtrip() {
        for ty in ValueType::ALL {
            assert_eq!(ValueType::from_keyword(ty.keyword()), Some(ty));
        }
    }
}
