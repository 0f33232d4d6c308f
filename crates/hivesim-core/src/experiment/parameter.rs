use serde::{Deserialize, Serialize};

use crate::model::ParameterDecl;
use crate::value::{Value, ValueType};

/// Value bound to a world variable before setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// Variable addressed by the parameter when it differs from `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var: Option<String>,
    #[serde(rename = "type", default)]
    pub ty: ValueType,
    pub value: Value,
}

impl Parameter {
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        let ty = value.value_type();
        Self {
            name: name.into(),
            var: None,
            ty,
            value,
        }
    }

    #[must_use]
    pub fn with_var(mut self, var: impl Into<String>) -> Self {
        self.var = Some(var.into());
        self
    }

    /// World variable receiving the value.
    #[must_use]
    pub fn target(&self) -> &str {
        self.var.as_deref().unwrap_or(&self.name)
    }
}

impl From<&ParameterDecl> for Parameter {
    fn from(decl: &ParameterDecl) -> Self {
        Self {
            name: decl.name.clone(),
            var: decl.var.clone(),
            ty: decl.ty,
            value: decl.value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_prefers_the_variable() {
        let plain = Parameter::new("rate", Value::Float(0.1));
        assert_eq!(plain.target(), "rate");
        assert_eq!(plain.ty, ValueType::Float);
        let addressed = Parameter::new("Birth rate", Value::Float(0.1)).with_var("rate");
        assert_eq!(addressed.target(), "rate");
    }
}
