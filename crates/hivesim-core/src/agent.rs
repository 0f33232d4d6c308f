//! Agent records stored in the simulation arena.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

use crate::geometry::{Point, Shape};
use crate::population::PopulationId;
use crate::value::Value;

new_key_type! {
    /// Stable handle referencing an agent in the simulation arena.
    pub struct AgentId;
}

/// Lifecycle of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Allocated but variables not bound yet.
    Unborn,
    Active,
    /// Killed during the current step; still readable until the sweep.
    Dying,
    /// Swept out of the arena. Never stored on an `Agent`; reported by
    /// `Simulation::lifecycle` for handles that outlived their agent.
    Disposed,
}

/// Position of an agent inside its population: `(index, generation)`.
///
/// Indices are recycled once an agent is disposed; the generation tells
/// successive occupants of the same index apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentSlot {
    pub index: usize,
    pub generation: u32,
}

/// Runtime state of a single agent.
#[derive(Debug, Clone)]
pub struct Agent {
    pub(crate) population: PopulationId,
    pub(crate) slot: AgentSlot,
    pub(crate) name: String,
    pub(crate) shape: Shape,
    pub(crate) variables: HashMap<String, Value>,
    pub(crate) micro_populations: Vec<PopulationId>,
    pub(crate) lifecycle: Lifecycle,
}

impl Agent {
    pub(crate) fn unborn(population: PopulationId, slot: AgentSlot, name: String) -> Self {
        Self {
            population,
            slot,
            name,
            shape: Shape::default(),
            variables: HashMap::new(),
            micro_populations: Vec::new(),
            lifecycle: Lifecycle::Unborn,
        }
    }

    #[must_use]
    pub fn population(&self) -> PopulationId {
        self.population
    }

    #[must_use]
    pub fn slot(&self) -> AgentSlot {
        self.slot
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.slot.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn location(&self) -> Point {
        self.shape.location()
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Whether the agent still takes part in the current step.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    /// Populations hosted by this agent, in declaration order.
    #[must_use]
    pub fn micro_populations(&self) -> &[PopulationId] {
        &self.micro_populations
    }

    /// Declared variable value, if bound.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}
