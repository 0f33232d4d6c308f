//! Ordered collections of same-species agents and their topology.

use hivesim_index::{Footprint, IndexError, NeighborhoodIndex, Topology};
use slotmap::new_key_type;

use crate::agent::{AgentId, AgentSlot};
use crate::species::SpeciesId;

new_key_type! {
    /// Stable handle referencing a population in the simulation arena.
    pub struct PopulationId;
}

/// Agents of one species hosted by one agent (none for the world population).
#[derive(Debug, Clone)]
pub struct Population {
    species: SpeciesId,
    species_name: String,
    host: Option<AgentId>,
    members: Vec<AgentId>,
    topology: Topology<AgentId>,
    generations: Vec<u32>,
    free_indices: Vec<usize>,
}

impl Population {
    pub(crate) fn new(
        species: SpeciesId,
        species_name: impl Into<String>,
        host: Option<AgentId>,
        topology: Topology<AgentId>,
    ) -> Self {
        Self {
            species,
            species_name: species_name.into(),
            host,
            members: Vec::new(),
            topology,
            generations: Vec::new(),
            free_indices: Vec::new(),
        }
    }

    #[must_use]
    pub fn species(&self) -> SpeciesId {
        self.species
    }

    #[must_use]
    pub fn species_name(&self) -> &str {
        &self.species_name
    }

    /// Hosting agent; `None` for the world population.
    #[must_use]
    pub fn host(&self) -> Option<AgentId> {
        self.host
    }

    /// Members in creation order.
    #[must_use]
    pub fn members(&self) -> &[AgentId] {
        &self.members
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn topology(&self) -> &Topology<AgentId> {
        &self.topology
    }

    pub(crate) fn replace_topology(&mut self, topology: Topology<AgentId>) {
        self.topology = topology;
    }

    /// Reserve an index, reusing the lowest freed one first.
    pub(crate) fn allocate_slot(&mut self) -> AgentSlot {
        self.free_indices.sort_unstable_by(|a, b| b.cmp(a));
        if let Some(index) = self.free_indices.pop() {
            return AgentSlot {
                index,
                generation: self.generations[index],
            };
        }
        self.generations.push(0);
        AgentSlot {
            index: self.generations.len() - 1,
            generation: 0,
        }
    }

    /// Hand back a slot whose agent never joined the population.
    pub(crate) fn release_slot(&mut self, slot: AgentSlot) {
        if self.generations.get(slot.index) == Some(&slot.generation)
            && !self.free_indices.contains(&slot.index)
        {
            self.free_indices.push(slot.index);
        }
    }

    /// Append a freshly created agent and index it.
    pub(crate) fn admit(&mut self, agent: AgentId, footprint: Footprint) -> Result<(), IndexError> {
        self.topology.insert(agent, footprint)?;
        self.members.push(agent);
        Ok(())
    }

    /// Drop an agent from the topology only; membership ends at the sweep.
    pub(crate) fn withdraw(&mut self, agent: AgentId) -> bool {
        self.topology.remove(agent)
    }

    /// Final removal: membership and topology together, slot recycled.
    pub(crate) fn evict(&mut self, agent: AgentId, slot: AgentSlot) {
        self.topology.remove(agent);
        if let Some(pos) = self.members.iter().position(|member| *member == agent) {
            self.members.remove(pos);
        }
        if let Some(generation) = self.generations.get_mut(slot.index) {
            *generation = generation.wrapping_add(1);
            self.free_indices.push(slot.index);
        }
    }

    pub(crate) fn update_footprint(
        &mut self,
        agent: AgentId,
        footprint: Footprint,
    ) -> Result<(), IndexError> {
        if self.topology.contains(agent) {
            self.topology.update(agent, footprint)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn slots_are_recycled_with_new_generation() {
        let mut ids: SlotMap<AgentId, ()> = SlotMap::with_key();
        let mut population = Population::new(SpeciesId(1), "ant", None, Topology::amorphous());
        let first = population.allocate_slot();
        let second = population.allocate_slot();
        let a = ids.insert(());
        let b = ids.insert(());
        population.admit(a, Footprint::default()).unwrap();
        population.admit(b, Footprint::default()).unwrap();
        assert_eq!((first.index, second.index), (0, 1));

        population.evict(a, first);
        assert_eq!(population.members(), &[b]);
        assert!(!population.topology().contains(a));
        let recycled = population.allocate_slot();
        assert_eq!(recycled.index, 0);
        assert_eq!(recycled.generation, 1);
        assert_eq!(population.allocate_slot().index, 2);
    }

    #[test]
    fn slot_of_a_rejected_agent_is_handed_out_again() {
        let mut ids: SlotMap<AgentId, ()> = SlotMap::with_key();
        let mut population = Population::new(SpeciesId(1), "ant", None, Topology::amorphous());
        let kept = population.allocate_slot();
        let agent = ids.insert(());
        population.admit(agent, Footprint::default()).unwrap();

        let rejected = population.allocate_slot();
        assert_eq!(
            population.admit(agent, Footprint::default()),
            Err(IndexError::AlreadyIndexed)
        );
        population.release_slot(rejected);
        population.release_slot(rejected);
        assert_eq!(population.members(), &[agent]);

        let reused = population.allocate_slot();
        assert_eq!((kept.index, reused.index), (0, 1));
        assert_eq!(reused.generation, 0);
        assert_eq!(population.allocate_slot().index, 2);
    }

    #[test]
    fn withdraw_keeps_membership_until_eviction() {
        let mut ids: SlotMap<AgentId, ()> = SlotMap::with_key();
        let mut population = Population::new(SpeciesId(1), "ant", None, Topology::amorphous());
        let slot = population.allocate_slot();
        let agent = ids.insert(());
        population.admit(agent, Footprint::default()).unwrap();
        assert!(population.withdraw(agent));
        assert_eq!(population.len(), 1);
        assert!(!population.topology().contains(agent));
        population.evict(agent, slot);
        assert!(population.is_empty());
    }
}
