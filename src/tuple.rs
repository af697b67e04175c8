// tuple.rs - Tuple storage and per-tuple scratch slots

use crate::arena::{NodeId, TupleIndex};
use crate::element_list::EntryId;
use crate::fact::{downcast_fact, Fact};
use crate::state::TupleState;
use smallvec::SmallVec;
use std::fmt::Write as _;
use std::rc::Rc;

/// Inline capacity for the fact array and the slot store. Networks rarely
/// join past arity four; larger tuples spill to the heap.
pub const INLINE_ARITY: usize = 4;

pub type FactVec = SmallVec<[Rc<dyn Fact>; INLINE_ARITY]>;

/// One scratch value a consumer node parks on a tuple it processes.
///
/// Slot indices are handed out at build time, per tuple-source stream, so a
/// node reads and writes fixed offsets with no hashing. The tagged enum
/// stands in for an untyped object array; a consumer always reads back the
/// variant it wrote.
#[derive(Debug, Clone, Default)]
pub enum Slot {
    #[default]
    Empty,
    /// Last predicate verdict (filter).
    Flag(bool),
    /// Index key this tuple is currently filed under.
    Key(u64),
    /// Intrusive-list entry handle for O(1) bucket removal.
    Entry(EntryId),
    /// Live match counter (if-exists).
    Count(u64),
    /// Single output tuple produced for this input (map).
    Out(TupleIndex),
    /// Output tuples produced for this input (join, flatten).
    OutList(SmallVec<[TupleIndex; 2]>),
    /// Collector undo receipt (group).
    Undo(u64),
}

/// One matched combination of facts at one node's output.
///
/// A tuple is owned by the node that created it, lives in the session's
/// tuple arena, and is never shared between nodes; consumers only park
/// scratch values in its slot store.
#[derive(Debug)]
pub struct Tuple {
    pub facts: FactVec,
    pub state: TupleState,
    /// Node that created this tuple.
    pub source: Option<NodeId>,
    store: SmallVec<[Slot; INLINE_ARITY]>,
}

impl Tuple {
    pub fn new(facts: FactVec, source: Option<NodeId>, store_size: usize) -> Self {
        let mut store = SmallVec::with_capacity(store_size);
        store.resize_with(store_size, Slot::default);
        Self {
            facts,
            state: TupleState::Creating,
            source,
            store,
        }
    }

    pub fn arity(&self) -> usize {
        self.facts.len()
    }

    /// Downcasts fact `index` to `T`.
    pub fn fact<T: Fact>(&self, index: usize) -> Option<&T> {
        self.facts.get(index).and_then(|f| downcast_fact::<T>(f.as_ref()))
    }

    pub fn fact_rc(&self, index: usize) -> Option<&Rc<dyn Fact>> {
        self.facts.get(index)
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.store[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.store[index]
    }

    pub fn set_slot(&mut self, index: usize, slot: Slot) {
        self.store[index] = slot;
    }

    /// Takes the slot value, leaving `Empty` behind.
    pub fn take_slot(&mut self, index: usize) -> Slot {
        std::mem::take(&mut self.store[index])
    }

    /// Concatenation of two fact arrays, for join outputs.
    pub fn combine_facts(left: &FactVec, right: &FactVec) -> FactVec {
        let mut facts = FactVec::with_capacity(left.len() + right.len());
        facts.extend(left.iter().cloned());
        facts.extend(right.iter().cloned());
        facts
    }

    /// Pairwise fact equality via `eq_fact`, for change detection.
    pub fn facts_equal(a: &FactVec, b: &FactVec) -> bool {
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_fact(y.as_ref()))
    }

    /// Debug rendering of the facts, for diagnostics on user-function failure.
    pub fn render_facts(&self) -> String {
        let mut out = String::from("[");
        for (i, fact) in self.facts.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{:?}", fact);
        }
        out.push(']');
        out
    }
}
