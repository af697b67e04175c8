// arena.rs - Tuple and node storage

use crate::error::{NetError, Result};
use crate::limits::ResourceLimits;
use crate::nodes::NodeData;
use crate::score::Score;
use crate::tuple::{FactVec, Tuple};
use generational_arena::Arena;
use slotmap::{new_key_type, SlotMap};

/// Generation-checked handle to a tuple. A handle kept past the tuple's
/// release is detected as stale instead of aliasing a recycled slot.
pub type TupleIndex = generational_arena::Index;

new_key_type! {
    /// Handle to a node in the network.
    pub struct NodeId;
}

/// Owns every tuple in a session.
#[derive(Debug)]
pub struct TupleArena {
    tuples: Arena<Tuple>,
    limits: ResourceLimits,
}

impl TupleArena {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            tuples: Arena::new(),
            limits,
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Allocates a tuple in `Creating` state.
    pub fn acquire(
        &mut self,
        facts: FactVec,
        source: Option<NodeId>,
        store_size: usize,
    ) -> Result<TupleIndex> {
        self.limits.check_tuple_count(self.tuples.len())?;
        Ok(self.tuples.insert(Tuple::new(facts, source, store_size)))
    }

    pub fn get(&self, index: TupleIndex) -> Result<&Tuple> {
        self.tuples
            .get(index)
            .ok_or_else(|| NetError::invalid_handle(format!("stale tuple handle {:?}", index)))
    }

    pub fn get_mut(&mut self, index: TupleIndex) -> Result<&mut Tuple> {
        self.tuples
            .get_mut(index)
            .ok_or_else(|| NetError::invalid_handle(format!("stale tuple handle {:?}", index)))
    }

    /// Removes a dead tuple from the arena.
    pub fn release(&mut self, index: TupleIndex) -> Result<Tuple> {
        self.tuples
            .remove(index)
            .ok_or_else(|| NetError::arena_error(format!("double release of {:?}", index)))
    }

    /// Debug-build invariant: after a full drain every surviving tuple is Ok.
    #[cfg(debug_assertions)]
    pub fn check_for_dirty_tuples(&self) -> Result<()> {
        for (index, tuple) in self.tuples.iter() {
            if tuple.state.is_dirty() {
                return Err(NetError::consistency_violation(format!(
                    "tuple {:?} from node {:?} left dirty ({:?}) after drain",
                    index, tuple.source, tuple.state
                )));
            }
        }
        Ok(())
    }
}

/// Owns every node in a session.
#[derive(Debug)]
pub struct NodeArena<S: Score> {
    nodes: SlotMap<NodeId, NodeData<S>>,
}

impl<S: Score> Default for NodeArena<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Score> NodeArena<S> {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, node: NodeData<S>) -> NodeId {
        self.nodes.insert(node)
    }

    pub fn get(&self, id: NodeId) -> Result<&NodeData<S>> {
        self.nodes
            .get(id)
            .ok_or_else(|| NetError::invalid_handle(format!("unknown node {:?}", id)))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut NodeData<S>> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| NetError::invalid_handle(format!("unknown node {:?}", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeData<S>)> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Fact;
    use smallvec::smallvec;
    use std::rc::Rc;

    fn one_fact() -> FactVec {
        smallvec![Rc::new(1i64) as Rc<dyn Fact>]
    }

    #[test]
    fn acquire_get_release_roundtrip() {
        let mut arena = TupleArena::new(ResourceLimits::default());
        let idx = arena.acquire(one_fact(), None, 2).unwrap();
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(idx).unwrap().arity(), 1);
        arena.release(idx).unwrap();
        assert!(arena.is_empty());
    }

    #[test]
    fn stale_handle_detected() {
        let mut arena = TupleArena::new(ResourceLimits::default());
        let idx = arena.acquire(one_fact(), None, 0).unwrap();
        arena.release(idx).unwrap();
        assert!(arena.get(idx).is_err());
        assert!(arena.release(idx).is_err());
        // a recycled slot carries a fresh generation
        let idx2 = arena.acquire(one_fact(), None, 0).unwrap();
        assert!(arena.get(idx2).is_ok());
        assert!(arena.get(idx).is_err());
    }

    #[test]
    fn tuple_limit_enforced() {
        let limits = ResourceLimits {
            max_tuples: 2,
            ..ResourceLimits::default()
        };
        let mut arena = TupleArena::new(limits);
        arena.acquire(one_fact(), None, 0).unwrap();
        arena.acquire(one_fact(), None, 0).unwrap();
        assert!(arena.acquire(one_fact(), None, 0).is_err());
    }
}
