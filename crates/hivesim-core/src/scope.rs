//! Evaluation scopes: agent call-stack, local bindings and randomness.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::trace;

use crate::agent::AgentId;
use crate::error::EvalError;
use crate::value::Value;

/// Liveness flag shared by a simulation and every scope opened on it.
#[derive(Debug)]
pub(crate) struct SimulationLiveness {
    alive: AtomicBool,
    open_scopes: AtomicUsize,
}

impl SimulationLiveness {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            open_scopes: AtomicUsize::new(0),
        })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn revoke(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub(crate) fn open_scopes(&self) -> usize {
        self.open_scopes.load(Ordering::Acquire)
    }
}

/// Execution context of one agent activation.
///
/// Scopes are opened by the simulation and must be released once the
/// activation ends; [`Scope::release`] is idempotent and also runs on drop.
/// A copy shares the simulation handle but owns its stack, locals and a
/// random stream forked from the parent.
#[derive(Debug)]
pub struct Scope {
    purpose: String,
    stack: Vec<AgentId>,
    locals: HashMap<String, Value>,
    rng: SmallRng,
    liveness: Arc<SimulationLiveness>,
    released: bool,
}

impl Scope {
    pub(crate) fn open(
        purpose: impl Into<String>,
        rng: SmallRng,
        liveness: Arc<SimulationLiveness>,
    ) -> Self {
        liveness.open_scopes.fetch_add(1, Ordering::AcqRel);
        Self {
            purpose: purpose.into(),
            stack: Vec::new(),
            locals: HashMap::new(),
            rng,
            liveness,
            released: false,
        }
    }

    #[must_use]
    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Fails once the scope was released or its simulation disposed.
    pub fn ensure_usable(&self) -> Result<(), EvalError> {
        if self.released {
            return Err(EvalError::ScopeReleased(self.purpose.clone()));
        }
        if !self.liveness.is_alive() {
            return Err(EvalError::SimulationDisposed);
        }
        Ok(())
    }

    pub fn push(&mut self, agent: AgentId) {
        self.stack.push(agent);
    }

    pub fn pop(&mut self) -> Option<AgentId> {
        self.stack.pop()
    }

    /// Innermost agent: the current `self`.
    pub fn current_agent(&self) -> Result<AgentId, EvalError> {
        self.ensure_usable()?;
        self.stack.last().copied().ok_or(EvalError::NoCurrentAgent)
    }

    /// The calling agent, second from the top of the stack.
    pub fn myself(&self) -> Result<AgentId, EvalError> {
        self.ensure_usable()?;
        let depth = self.stack.len();
        if depth < 2 {
            return Err(EvalError::NoCaller);
        }
        Ok(self.stack[depth - 2])
    }

    #[must_use]
    pub fn stack(&self) -> &[AgentId] {
        &self.stack
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn resolve_local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    pub fn bind_local(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Independent scope for evaluating on behalf of another frame.
    ///
    /// The parent's random stream advances by one fork so sibling copies
    /// draw different but reproducible numbers.
    pub fn copy(&mut self, purpose: impl Into<String>) -> Result<Scope, EvalError> {
        self.ensure_usable()?;
        let rng = SmallRng::from_rng(&mut self.rng);
        let mut copy = Scope::open(purpose, rng, Arc::clone(&self.liveness));
        copy.stack.clone_from(&self.stack);
        copy.locals.clone_from(&self.locals);
        Ok(copy)
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Drop the stack and locals. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stack.clear();
        self.locals.clear();
        self.liveness.open_scopes.fetch_sub(1, Ordering::AcqRel);
        trace!(purpose = %self.purpose, "scope released");
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use slotmap::SlotMap;

    fn agents(count: usize) -> Vec<AgentId> {
        let mut arena: SlotMap<AgentId, ()> = SlotMap::with_key();
        (0..count).map(|_| arena.insert(())).collect()
    }

    fn scope(liveness: &Arc<SimulationLiveness>) -> Scope {
        Scope::open("test", SmallRng::seed_from_u64(7), Arc::clone(liveness))
    }

    #[test]
    fn myself_is_second_from_top() {
        let liveness = SimulationLiveness::new();
        let ids = agents(3);
        let mut scope = scope(&liveness);
        assert_eq!(scope.current_agent(), Err(EvalError::NoCurrentAgent));
        scope.push(ids[0]);
        assert_eq!(scope.myself(), Err(EvalError::NoCaller));
        scope.push(ids[1]);
        scope.push(ids[2]);
        assert_eq!(scope.current_agent(), Ok(ids[2]));
        assert_eq!(scope.myself(), Ok(ids[1]));
    }

    #[test]
    fn copies_do_not_touch_the_parent_frame() {
        let liveness = SimulationLiveness::new();
        let ids = agents(2);
        let mut parent = scope(&liveness);
        parent.push(ids[0]);
        parent.bind_local("x", Value::Int(1));
        let mut child = parent.copy("ask").expect("copy");
        child.push(ids[1]);
        child.bind_local("x", Value::Int(2));
        assert_eq!(parent.stack(), &[ids[0]]);
        assert_eq!(parent.resolve_local("x"), Some(&Value::Int(1)));
        assert_eq!(liveness.open_scopes(), 2);
        child.release();
        assert_eq!(liveness.open_scopes(), 1);
    }

    #[test]
    fn release_is_idempotent_and_runs_on_drop() {
        let liveness = SimulationLiveness::new();
        let mut scope = scope(&liveness);
        scope.release();
        scope.release();
        assert!(scope.is_released());
        assert_eq!(liveness.open_scopes(), 0);
        assert!(matches!(scope.current_agent(), Err(EvalError::ScopeReleased(_))));
        {
            let _other = Scope::open("dropped", SmallRng::seed_from_u64(1), Arc::clone(&liveness));
            assert_eq!(liveness.open_scopes(), 1);
        }
        assert_eq!(liveness.open_scopes(), 0);
    }

    #[test]
    fn revoked_simulation_invalidates_scopes() {
        let liveness = SimulationLiveness::new();
        let ids = agents(1);
        let mut scope = scope(&liveness);
        scope.push(ids[0]);
        liveness.revoke();
        assert_eq!(scope.current_agent(), Err(EvalError::SimulationDisposed));
        assert!(scope.copy("late").is_err());
    }

    #[test]
    fn forked_streams_are_reproducible() {
        let draw = || {
            let liveness = SimulationLiveness::new();
            let mut parent = scope(&liveness);
            let mut child = parent.copy("fork").expect("copy");
            (parent.rng().random::<u64>(), child.rng().random::<u64>())
        };
        let (a, b) = draw();
        assert_eq!(draw(), (a, b));
        assert_ne!(a, b);
    }
}
