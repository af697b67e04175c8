// nodes.rs - Node kinds and the propagation machinery

use crate::arena::{NodeId, TupleArena, TupleIndex};
use crate::collectors::{Collector, CollectorFactory};
use crate::error::{NetError, Result};
use crate::fact::Fact;
use crate::index::UniIndex;
use crate::inliner::{ConstraintRef, ScoreInliner, UndoImpact};
use crate::score::{Score, ScoreImpacter};
use crate::state::TupleState;
use crate::tuple::{FactVec, Slot, Tuple};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::any::TypeId;
use std::cell::RefCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

/// Join/existence key extractor; `None` marks an unassigned value.
pub type KeyFn = Rc<dyn Fn(&Tuple) -> Option<u64>>;
pub type Predicate = Rc<dyn Fn(&Tuple) -> bool>;
/// Map function: the facts of the single output tuple.
pub type MapperFn = Rc<dyn Fn(&Tuple) -> FactVec>;
/// Flatten function: the facts of zero or more output tuples.
pub type ExpandFn = Rc<dyn Fn(&Tuple) -> Vec<FactVec>>;
pub type GroupKeyFn = Rc<dyn Fn(&Tuple) -> Rc<dyn Fact>>;
pub type MatchWeightFn = Rc<dyn Fn(&Tuple) -> i64>;
/// Assignedness test for source nodes that exclude unassigned facts.
pub type AssignedFn = Rc<dyn Fn(&dyn Fact) -> bool>;

/// Which input of a two-input node a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Single,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Insert,
    Update,
    Retract,
}

/// Drain phases of one layer. Retracts leave first so a tuple moved within
/// one batch is never seen twice by a later layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Retract,
    Update,
    Insert,
}

/// Downstream edge: the consumer node and the input side it listens on.
#[derive(Debug, Clone, Copy)]
pub struct ChildRef {
    pub node: NodeId,
    pub side: Side,
}

/// One pending lifecycle call addressed to a node input.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub target: NodeId,
    pub side: Side,
    pub op: Op,
    pub tuple: TupleIndex,
}

fn emit(children: &[ChildRef], op: Op, tuple: TupleIndex, out: &mut Vec<Command>) {
    for child in children {
        out.push(Command {
            target: child.node,
            side: child.side,
            op,
            tuple,
        });
    }
}

/// Runs a user closure, converting a panic into a wrapped error carrying the
/// facts the closure was looking at.
pub(crate) fn guard_user<T>(context: &str, tuple: &Tuple, f: impl FnOnce() -> T) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        NetError::user_function(context, message, tuple.render_facts())
    })
}

// ---------------------------------------------------------------------------
// Propagation queue

/// Per-node buckets of the node's own dirty output tuples.
///
/// Scheduling only flips tuple state and files the handle; nothing reaches
/// the children until the session drains the node's layer. A bucket entry
/// whose tuple state moved on is skipped at drain time.
#[derive(Debug, Default)]
pub struct PropagationQueue {
    retracts: Vec<TupleIndex>,
    updates: Vec<TupleIndex>,
    inserts: Vec<TupleIndex>,
}

impl PropagationQueue {
    /// Files a freshly acquired (Creating) tuple.
    pub fn schedule_insert(&mut self, index: TupleIndex, tuple: &Tuple) -> Result<()> {
        if tuple.state != TupleState::Creating {
            return Err(NetError::consistency_violation(format!(
                "insert scheduled for tuple in state {:?}",
                tuple.state
            )));
        }
        self.inserts.push(index);
        Ok(())
    }

    pub fn schedule_update(&mut self, index: TupleIndex, tuple: &mut Tuple) -> Result<()> {
        match tuple.state {
            TupleState::Ok => {
                tuple.state = TupleState::Updating;
                self.updates.push(index);
                Ok(())
            }
            // already pending; the refreshed facts ride along
            TupleState::Creating | TupleState::Updating => Ok(()),
            other => Err(NetError::consistency_violation(format!(
                "update scheduled for tuple in state {:?}",
                other
            ))),
        }
    }

    pub fn schedule_retract(&mut self, index: TupleIndex, tuple: &mut Tuple) -> Result<()> {
        match tuple.state {
            TupleState::Creating => {
                // never seen downstream, dies silently
                tuple.state = TupleState::Aborting;
                self.retracts.push(index);
                Ok(())
            }
            TupleState::Ok | TupleState::Updating => {
                tuple.state = TupleState::Dying;
                self.retracts.push(index);
                Ok(())
            }
            other => Err(NetError::consistency_violation(format!(
                "retract scheduled for tuple in state {:?}",
                other
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.retracts.is_empty() && self.updates.is_empty() && self.inserts.is_empty()
    }

    /// Drains one phase bucket into commands for `children`. Tuples leaving
    /// the network are appended to `release`; the session frees them after
    /// the commands have been dispatched (consumers still read their slots).
    pub fn flush(
        &mut self,
        phase: Phase,
        children: &[ChildRef],
        tuples: &mut TupleArena,
        cmds: &mut Vec<Command>,
        release: &mut Vec<TupleIndex>,
    ) -> Result<()> {
        match phase {
            Phase::Retract => {
                for index in std::mem::take(&mut self.retracts) {
                    let tuple = tuples.get_mut(index)?;
                    match tuple.state {
                        TupleState::Aborting => {
                            tuple.state = TupleState::Dead;
                            release.push(index);
                        }
                        TupleState::Dying => {
                            tuple.state = TupleState::Dead;
                            emit(children, Op::Retract, index, cmds);
                            release.push(index);
                        }
                        other => {
                            return Err(NetError::consistency_violation(format!(
                                "retract bucket held tuple in state {:?}",
                                other
                            )))
                        }
                    }
                }
            }
            Phase::Update => {
                for index in std::mem::take(&mut self.updates) {
                    // stale entries (retracted after the update) are gone or Dead
                    let Ok(tuple) = tuples.get_mut(index) else { continue };
                    if tuple.state == TupleState::Updating {
                        tuple.state = TupleState::Ok;
                        emit(children, Op::Update, index, cmds);
                    }
                }
            }
            Phase::Insert => {
                for index in std::mem::take(&mut self.inserts) {
                    // aborted entries were already released in the retract phase
                    let Ok(tuple) = tuples.get_mut(index) else { continue };
                    if tuple.state == TupleState::Creating {
                        tuple.state = TupleState::Ok;
                        emit(children, Op::Insert, index, cmds);
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Source node

/// Entry point for one declared fact type. At most two may exist per type:
/// one admitting every fact and one admitting only assigned facts.
pub struct SourceNode {
    pub id: NodeId,
    pub children: Vec<ChildRef>,
    pub fact_type: TypeId,
    pub include_unassigned: bool,
    pub assigned_fn: Option<AssignedFn>,
    pub store_size: usize,
    pub queue: PropagationQueue,
}

impl fmt::Debug for SourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceNode")
            .field("fact_type", &self.fact_type)
            .field("include_unassigned", &self.include_unassigned)
            .field("children", &self.children.len())
            .finish()
    }
}

impl SourceNode {
    pub fn new(fact_type: TypeId, include_unassigned: bool, assigned_fn: Option<AssignedFn>) -> Self {
        Self {
            id: NodeId::default(),
            children: Vec::new(),
            fact_type,
            include_unassigned,
            assigned_fn,
            store_size: 0,
            queue: PropagationQueue::default(),
        }
    }

    /// Whether this source creates a tuple for `fact` at all.
    pub fn admits(&self, fact: &dyn Fact) -> bool {
        if self.include_unassigned {
            true
        } else {
            self.assigned_fn.as_ref().map_or(true, |f| f(fact))
        }
    }

    /// Creates and files the source tuple for a newly inserted fact.
    pub fn insert_fact(&mut self, fact: Rc<dyn Fact>, tuples: &mut TupleArena) -> Result<TupleIndex> {
        let mut facts = FactVec::new();
        facts.push(fact);
        let index = tuples.acquire(facts, Some(self.id), self.store_size)?;
        self.queue.schedule_insert(index, tuples.get(index)?)?;
        Ok(index)
    }

    /// Swaps in the updated fact and schedules the update.
    pub fn update_fact(
        &mut self,
        index: TupleIndex,
        fact: Rc<dyn Fact>,
        tuples: &mut TupleArena,
    ) -> Result<()> {
        let tuple = tuples.get_mut(index)?;
        tuple.facts[0] = fact;
        self.queue.schedule_update(index, tuple)
    }

    pub fn retract_fact(&mut self, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        let tuple = tuples.get_mut(index)?;
        self.queue.schedule_retract(index, tuple)
    }
}

// ---------------------------------------------------------------------------
// Filter node

/// Pass-through predicate gate. The last verdict lives in a slot on the
/// input tuple so update transitions and retracts never re-evaluate stale
/// facts.
pub struct FilterNode {
    pub children: Vec<ChildRef>,
    pub predicate: Predicate,
    pub verdict_slot: usize,
    pub label: String,
}

impl fmt::Debug for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterNode")
            .field("label", &self.label)
            .field("verdict_slot", &self.verdict_slot)
            .field("predicate", &"<function>")
            .finish()
    }
}

impl FilterNode {
    fn apply(
        &mut self,
        op: Op,
        index: TupleIndex,
        tuples: &mut TupleArena,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        match op {
            Op::Insert => {
                let tuple = tuples.get(index)?;
                let pass = guard_user(&self.label, tuple, || (self.predicate)(tuple))?;
                tuples.get_mut(index)?.set_slot(self.verdict_slot, Slot::Flag(pass));
                if pass {
                    emit(&self.children, Op::Insert, index, out);
                }
            }
            Op::Update => {
                let tuple = tuples.get(index)?;
                let old = matches!(tuple.slot(self.verdict_slot), Slot::Flag(true));
                let new = guard_user(&self.label, tuple, || (self.predicate)(tuple))?;
                tuples.get_mut(index)?.set_slot(self.verdict_slot, Slot::Flag(new));
                match (old, new) {
                    (true, true) => emit(&self.children, Op::Update, index, out),
                    (true, false) => emit(&self.children, Op::Retract, index, out),
                    (false, true) => emit(&self.children, Op::Insert, index, out),
                    (false, false) => {}
                }
            }
            Op::Retract => {
                let old = tuples.get_mut(index)?.take_slot(self.verdict_slot);
                if matches!(old, Slot::Flag(true)) {
                    emit(&self.children, Op::Retract, index, out);
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Map node

/// One output tuple per input tuple, facts produced by the mapper.
pub struct MapNode {
    pub id: NodeId,
    pub children: Vec<ChildRef>,
    pub mapper: MapperFn,
    pub out_slot: usize,
    pub out_store_size: usize,
    pub queue: PropagationQueue,
    pub label: String,
}

impl fmt::Debug for MapNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapNode")
            .field("label", &self.label)
            .field("mapper", &"<function>")
            .finish()
    }
}

impl MapNode {
    fn apply(&mut self, op: Op, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        match op {
            Op::Insert => {
                let tuple = tuples.get(index)?;
                let facts = guard_user(&self.label, tuple, || (self.mapper)(tuple))?;
                let out = tuples.acquire(facts, Some(self.id), self.out_store_size)?;
                self.queue.schedule_insert(out, tuples.get(out)?)?;
                tuples.get_mut(index)?.set_slot(self.out_slot, Slot::Out(out));
            }
            Op::Update => {
                let out = match tuples.get(index)?.slot(self.out_slot) {
                    Slot::Out(out) => *out,
                    _ => {
                        return Err(NetError::consistency_violation(
                            "map update without a mapped output",
                        ))
                    }
                };
                let tuple = tuples.get(index)?;
                let facts = guard_user(&self.label, tuple, || (self.mapper)(tuple))?;
                let out_tuple = tuples.get_mut(out)?;
                if !Tuple::facts_equal(&out_tuple.facts, &facts) {
                    out_tuple.facts = facts;
                }
                self.queue.schedule_update(out, tuples.get_mut(out)?)?;
            }
            Op::Retract => {
                if let Slot::Out(out) = tuples.get_mut(index)?.take_slot(self.out_slot) {
                    self.queue.schedule_retract(out, tuples.get_mut(out)?)?;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Flatten node

/// Zero or more output tuples per input tuple. Updates retract the previous
/// expansion wholesale and re-expand; expansion identity is not tracked.
pub struct FlatMapNode {
    pub id: NodeId,
    pub children: Vec<ChildRef>,
    pub expander: ExpandFn,
    pub outs_slot: usize,
    pub out_store_size: usize,
    pub queue: PropagationQueue,
    pub label: String,
}

impl fmt::Debug for FlatMapNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatMapNode")
            .field("label", &self.label)
            .field("expander", &"<function>")
            .finish()
    }
}

impl FlatMapNode {
    fn expand(&mut self, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        let tuple = tuples.get(index)?;
        let expansions = guard_user(&self.label, tuple, || (self.expander)(tuple))?;
        let mut outs: SmallVec<[TupleIndex; 2]> = SmallVec::new();
        for facts in expansions {
            let out = tuples.acquire(facts, Some(self.id), self.out_store_size)?;
            self.queue.schedule_insert(out, tuples.get(out)?)?;
            outs.push(out);
        }
        tuples.get_mut(index)?.set_slot(self.outs_slot, Slot::OutList(outs));
        Ok(())
    }

    fn contract(&mut self, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        if let Slot::OutList(outs) = tuples.get_mut(index)?.take_slot(self.outs_slot) {
            for out in outs {
                self.queue.schedule_retract(out, tuples.get_mut(out)?)?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: Op, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        match op {
            Op::Insert => self.expand(index, tuples),
            Op::Update => {
                self.contract(index, tuples)?;
                self.expand(index, tuples)
            }
            Op::Retract => self.contract(index, tuples),
        }
    }
}

// ---------------------------------------------------------------------------
// Join node

/// Slot layout a join input stream reserves on its tuples.
#[derive(Debug, Clone, Copy)]
pub struct JoinSlots {
    pub key: usize,
    pub entry: usize,
    pub outs: usize,
}

/// Binary equality join with an optional residual predicate over the
/// combined facts. Output tuples are owned by the join; beta memory ties
/// each output to its (left, right) pair for refreshes and retraction.
pub struct JoinNode {
    pub id: NodeId,
    pub children: Vec<ChildRef>,
    pub left_key: KeyFn,
    pub right_key: KeyFn,
    pub residual: Option<Predicate>,
    left_index: UniIndex,
    right_index: UniIndex,
    beta: FxHashMap<(TupleIndex, TupleIndex), TupleIndex>,
    pair_of: FxHashMap<TupleIndex, (TupleIndex, TupleIndex)>,
    pub left_slots: JoinSlots,
    pub right_slots: JoinSlots,
    pub out_store_size: usize,
    pub queue: PropagationQueue,
    pub label: String,
}

impl fmt::Debug for JoinNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinNode")
            .field("label", &self.label)
            .field("pairs", &self.beta.len())
            .field("left_key", &"<function>")
            .field("right_key", &"<function>")
            .finish()
    }
}

impl JoinNode {
    pub fn new(
        left_key: KeyFn,
        right_key: KeyFn,
        residual: Option<Predicate>,
        left_slots: JoinSlots,
        right_slots: JoinSlots,
        label: String,
    ) -> Self {
        Self {
            id: NodeId::default(),
            children: Vec::new(),
            left_key,
            right_key,
            residual,
            left_index: UniIndex::new(),
            right_index: UniIndex::new(),
            beta: FxHashMap::default(),
            pair_of: FxHashMap::default(),
            left_slots,
            right_slots,
            out_store_size: 0,
            queue: PropagationQueue::default(),
            label,
        }
    }

    fn slots(&self, side: Side) -> JoinSlots {
        match side {
            Side::Left => self.left_slots,
            _ => self.right_slots,
        }
    }

    fn key_fn(&self, side: Side) -> &KeyFn {
        match side {
            Side::Left => &self.left_key,
            _ => &self.right_key,
        }
    }

    fn residual_passes(&self, facts: &FactVec, probe: &Tuple) -> Result<bool> {
        match &self.residual {
            None => Ok(true),
            Some(pred) => {
                let candidate = Tuple::new(facts.clone(), None, 0);
                guard_user(&self.label, probe, || pred(&candidate))
            }
        }
    }

    fn combined(&self, left: TupleIndex, right: TupleIndex, tuples: &TupleArena) -> Result<FactVec> {
        let l = tuples.get(left)?;
        let r = tuples.get(right)?;
        Ok(Tuple::combine_facts(&l.facts, &r.facts))
    }

    /// Creates the output for a (left, right) pair when the residual passes.
    fn try_create_pair(
        &mut self,
        left: TupleIndex,
        right: TupleIndex,
        tuples: &mut TupleArena,
    ) -> Result<()> {
        let facts = self.combined(left, right, tuples)?;
        if !self.residual_passes(&facts, tuples.get(left)?)? {
            return Ok(());
        }
        let out = tuples.acquire(facts, Some(self.id), self.out_store_size)?;
        self.queue.schedule_insert(out, tuples.get(out)?)?;
        self.beta.insert((left, right), out);
        self.pair_of.insert(out, (left, right));
        Self::push_out(tuples, left, self.left_slots.outs, out)?;
        Self::push_out(tuples, right, self.right_slots.outs, out)?;
        Ok(())
    }

    fn push_out(tuples: &mut TupleArena, input: TupleIndex, slot: usize, out: TupleIndex) -> Result<()> {
        match tuples.get_mut(input)?.slot_mut(slot) {
            Slot::OutList(list) => list.push(out),
            other => {
                let mut list: SmallVec<[TupleIndex; 2]> = SmallVec::new();
                list.push(out);
                *other = Slot::OutList(list);
            }
        }
        Ok(())
    }

    fn drop_out(tuples: &mut TupleArena, input: TupleIndex, slot: usize, out: TupleIndex) -> Result<()> {
        if let Slot::OutList(list) = tuples.get_mut(input)?.slot_mut(slot) {
            list.retain(|o| *o != out);
        }
        Ok(())
    }

    /// Retracts the output of one pair and unlinks all bookkeeping.
    fn destroy_pair(&mut self, out: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        let (left, right) = self.pair_of.remove(&out).ok_or_else(|| {
            NetError::consistency_violation("join output without pair record")
        })?;
        self.beta.remove(&(left, right));
        Self::drop_out(tuples, left, self.left_slots.outs, out)?;
        Self::drop_out(tuples, right, self.right_slots.outs, out)?;
        self.queue.schedule_retract(out, tuples.get_mut(out)?)
    }

    fn insert_side(&mut self, side: Side, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        let slots = self.slots(side);
        let tuple = tuples.get(index)?;
        let key_fn = self.key_fn(side).clone();
        let key = guard_user(&self.label, tuple, || key_fn(tuple))?;
        let Some(key) = key else {
            // unassigned values never participate in matches
            return Ok(());
        };
        let entry = match side {
            Side::Left => self.left_index.put(key, index),
            _ => self.right_index.put(key, index),
        };
        {
            let tuple = tuples.get_mut(index)?;
            tuple.set_slot(slots.key, Slot::Key(key));
            tuple.set_slot(slots.entry, Slot::Entry(entry));
        }
        let partners = match side {
            Side::Left => self.right_index.matches(key),
            _ => self.left_index.matches(key),
        };
        for partner in partners {
            let (left, right) = match side {
                Side::Left => (index, partner),
                _ => (partner, index),
            };
            self.try_create_pair(left, right, tuples)?;
        }
        Ok(())
    }

    fn retract_side(&mut self, side: Side, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        let slots = self.slots(side);
        let (key_slot, entry_slot) = {
            let tuple = tuples.get_mut(index)?;
            (tuple.take_slot(slots.key), tuple.take_slot(slots.entry))
        };
        if let (Slot::Key(key), Slot::Entry(entry)) = (key_slot, entry_slot) {
            match side {
                Side::Left => self.left_index.remove(key, entry),
                _ => self.right_index.remove(key, entry),
            };
        }
        let outs = match tuples.get_mut(index)?.take_slot(slots.outs) {
            Slot::OutList(outs) => outs,
            _ => SmallVec::new(),
        };
        for out in outs {
            self.destroy_pair(out, tuples)?;
        }
        Ok(())
    }

    fn update_side(&mut self, side: Side, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        let slots = self.slots(side);
        let old_key = match tuples.get(index)?.slot(slots.key) {
            Slot::Key(k) => Some(*k),
            _ => None,
        };
        let tuple = tuples.get(index)?;
        let key_fn = self.key_fn(side).clone();
        let new_key = guard_user(&self.label, tuple, || key_fn(tuple))?;

        if old_key != new_key {
            // re-key: tear down and replay as a fresh insert
            self.retract_side(side, index, tuples)?;
            return self.insert_side(side, index, tuples);
        }
        let Some(key) = new_key else { return Ok(()) };

        // same bucket; reconcile each partner against the residual
        let partners = match side {
            Side::Left => self.right_index.matches(key),
            _ => self.left_index.matches(key),
        };
        for partner in partners {
            let (left, right) = match side {
                Side::Left => (index, partner),
                _ => (partner, index),
            };
            let existing = self.beta.get(&(left, right)).copied();
            let facts = self.combined(left, right, tuples)?;
            let passes = self.residual_passes(&facts, tuples.get(index)?)?;
            match (existing, passes) {
                (Some(out), true) => {
                    let out_tuple = tuples.get_mut(out)?;
                    out_tuple.facts = facts;
                    self.queue.schedule_update(out, tuples.get_mut(out)?)?;
                }
                (Some(out), false) => self.destroy_pair(out, tuples)?,
                (None, true) => self.try_create_pair(left, right, tuples)?,
                (None, false) => {}
            }
        }
        Ok(())
    }

    fn apply(&mut self, side: Side, op: Op, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        match op {
            Op::Insert => self.insert_side(side, index, tuples),
            Op::Update => self.update_side(side, index, tuples),
            Op::Retract => self.retract_side(side, index, tuples),
        }
    }
}

// ---------------------------------------------------------------------------
// If-exists node

/// Slot layout for the left input of an existence node.
#[derive(Debug, Clone, Copy)]
pub struct ExistsLeftSlots {
    pub key: usize,
    pub entry: usize,
    pub count: usize,
}

/// Slot layout for the right input of an existence node.
#[derive(Debug, Clone, Copy)]
pub struct ExistsRightSlots {
    pub key: usize,
    pub entry: usize,
}

/// Semi-join: forwards its left tuple while the existence condition holds.
/// Match counts live on the left tuples; right-side changes only touch the
/// lefts in the affected bucket. With `include_unassigned`, a left whose key
/// is unassigned counts as trivially matched.
pub struct IfExistsNode {
    pub children: Vec<ChildRef>,
    pub should_exist: bool,
    pub include_unassigned: bool,
    pub left_key: KeyFn,
    pub right_key: KeyFn,
    left_index: UniIndex,
    right_index: UniIndex,
    pub left_slots: ExistsLeftSlots,
    pub right_slots: ExistsRightSlots,
    pub label: String,
}

impl fmt::Debug for IfExistsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IfExistsNode")
            .field("label", &self.label)
            .field("should_exist", &self.should_exist)
            .field("include_unassigned", &self.include_unassigned)
            .finish()
    }
}

impl IfExistsNode {
    pub fn new(
        should_exist: bool,
        include_unassigned: bool,
        left_key: KeyFn,
        right_key: KeyFn,
        left_slots: ExistsLeftSlots,
        right_slots: ExistsRightSlots,
        label: String,
    ) -> Self {
        Self {
            children: Vec::new(),
            should_exist,
            include_unassigned,
            left_key,
            right_key,
            left_index: UniIndex::new(),
            right_index: UniIndex::new(),
            left_slots,
            right_slots,
            label,
        }
    }

    fn visible(&self, count: u64) -> bool {
        (count > 0) == self.should_exist
    }

    /// Visibility of a left tuple whose key is unassigned.
    fn visible_unassigned(&self) -> bool {
        self.include_unassigned == self.should_exist
    }

    fn left_visibility(&self, tuple: &Tuple) -> bool {
        match tuple.slot(self.left_slots.key) {
            Slot::Key(_) => match tuple.slot(self.left_slots.count) {
                Slot::Count(n) => self.visible(*n),
                _ => false,
            },
            _ => self.visible_unassigned(),
        }
    }

    fn attach_left(&mut self, index: TupleIndex, tuples: &mut TupleArena) -> Result<bool> {
        let tuple = tuples.get(index)?;
        let key_fn = self.left_key.clone();
        let key = guard_user(&self.label, tuple, || key_fn(tuple))?;
        match key {
            None => Ok(self.visible_unassigned()),
            Some(key) => {
                let entry = self.left_index.put(key, index);
                let count = self.right_index.count(key) as u64;
                let tuple = tuples.get_mut(index)?;
                tuple.set_slot(self.left_slots.key, Slot::Key(key));
                tuple.set_slot(self.left_slots.entry, Slot::Entry(entry));
                tuple.set_slot(self.left_slots.count, Slot::Count(count));
                Ok(self.visible(count))
            }
        }
    }

    fn detach_left(&mut self, index: TupleIndex, tuples: &mut TupleArena) -> Result<bool> {
        let tuple = tuples.get_mut(index)?;
        let was_visible = self.left_visibility(tuple);
        let key_slot = tuple.take_slot(self.left_slots.key);
        let entry_slot = tuple.take_slot(self.left_slots.entry);
        tuple.take_slot(self.left_slots.count);
        if let (Slot::Key(key), Slot::Entry(entry)) = (key_slot, entry_slot) {
            self.left_index.remove(key, entry);
        }
        Ok(was_visible)
    }

    fn apply_left(
        &mut self,
        op: Op,
        index: TupleIndex,
        tuples: &mut TupleArena,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        match op {
            Op::Insert => {
                if self.attach_left(index, tuples)? {
                    emit(&self.children, Op::Insert, index, out);
                }
            }
            Op::Update => {
                let was_visible = self.detach_left(index, tuples)?;
                let now_visible = self.attach_left(index, tuples)?;
                match (was_visible, now_visible) {
                    (true, true) => emit(&self.children, Op::Update, index, out),
                    (true, false) => emit(&self.children, Op::Retract, index, out),
                    (false, true) => emit(&self.children, Op::Insert, index, out),
                    (false, false) => {}
                }
            }
            Op::Retract => {
                if self.detach_left(index, tuples)? {
                    emit(&self.children, Op::Retract, index, out);
                }
            }
        }
        Ok(())
    }

    /// Adjusts the match counter of every left in `key`'s bucket by one and
    /// flips visibility where the zero boundary was crossed.
    fn shift_bucket(
        &mut self,
        key: u64,
        delta: i64,
        tuples: &mut TupleArena,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        for left in self.left_index.matches(key) {
            let tuple = tuples.get_mut(left)?;
            let old = match tuple.slot(self.left_slots.count) {
                Slot::Count(n) => *n,
                _ => continue,
            };
            let new = (old as i64 + delta) as u64;
            tuple.set_slot(self.left_slots.count, Slot::Count(new));
            let was_visible = self.visible(old);
            let now_visible = self.visible(new);
            match (was_visible, now_visible) {
                (false, true) => emit(&self.children, Op::Insert, left, out),
                (true, false) => emit(&self.children, Op::Retract, left, out),
                _ => {}
            }
        }
        Ok(())
    }

    fn attach_right(
        &mut self,
        index: TupleIndex,
        tuples: &mut TupleArena,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        let tuple = tuples.get(index)?;
        let key_fn = self.right_key.clone();
        let Some(key) = guard_user(&self.label, tuple, || key_fn(tuple))? else {
            return Ok(());
        };
        let entry = self.right_index.put(key, index);
        let tuple = tuples.get_mut(index)?;
        tuple.set_slot(self.right_slots.key, Slot::Key(key));
        tuple.set_slot(self.right_slots.entry, Slot::Entry(entry));
        self.shift_bucket(key, 1, tuples, out)
    }

    fn detach_right(
        &mut self,
        index: TupleIndex,
        tuples: &mut TupleArena,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        let tuple = tuples.get_mut(index)?;
        let key_slot = tuple.take_slot(self.right_slots.key);
        let entry_slot = tuple.take_slot(self.right_slots.entry);
        if let (Slot::Key(key), Slot::Entry(entry)) = (key_slot, entry_slot) {
            self.right_index.remove(key, entry);
            self.shift_bucket(key, -1, tuples, out)?;
        }
        Ok(())
    }

    fn apply_right(
        &mut self,
        op: Op,
        index: TupleIndex,
        tuples: &mut TupleArena,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        match op {
            Op::Insert => self.attach_right(index, tuples, out),
            Op::Retract => self.detach_right(index, tuples, out),
            Op::Update => {
                let old_key = match tuples.get(index)?.slot(self.right_slots.key) {
                    Slot::Key(k) => Some(*k),
                    _ => None,
                };
                let tuple = tuples.get(index)?;
                let key_fn = self.right_key.clone();
                let new_key = guard_user(&self.label, tuple, || key_fn(tuple))?;
                if old_key == new_key {
                    // a right update never changes left visibility
                    return Ok(());
                }
                self.detach_right(index, tuples, out)?;
                self.attach_right(index, tuples, out)
            }
        }
    }

    fn apply(
        &mut self,
        side: Side,
        op: Op,
        index: TupleIndex,
        tuples: &mut TupleArena,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        match side {
            Side::Right => self.apply_right(op, index, tuples, out),
            _ => self.apply_left(op, index, tuples, out),
        }
    }
}

// ---------------------------------------------------------------------------
// Group node

#[derive(Debug, Clone, Copy)]
pub struct GroupSlots {
    pub key: usize,
    pub undo: usize,
}

struct Group {
    key_fact: Option<Rc<dyn Fact>>,
    collector: Option<Box<dyn Collector>>,
    parent_count: usize,
    out: TupleIndex,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("parent_count", &self.parent_count)
            .field("out", &self.out)
            .finish()
    }
}

/// Aggregates member tuples into one output tuple per group key.
///
/// The first member creates the group and its output; the last member's
/// departure retracts the output and removes the group. Key and collector
/// are both optional (at least one is present): no key means one global
/// aggregate, no collector means distinct keys.
pub struct GroupNode {
    pub id: NodeId,
    pub children: Vec<ChildRef>,
    pub key_fn: Option<GroupKeyFn>,
    pub collector_factory: Option<CollectorFactory>,
    groups: FxHashMap<u64, Group>,
    pub slots: GroupSlots,
    pub out_store_size: usize,
    pub queue: PropagationQueue,
    pub label: String,
}

impl fmt::Debug for GroupNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupNode")
            .field("label", &self.label)
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl GroupNode {
    pub fn new(
        key_fn: Option<GroupKeyFn>,
        collector_factory: Option<CollectorFactory>,
        slots: GroupSlots,
        label: String,
    ) -> Self {
        Self {
            id: NodeId::default(),
            children: Vec::new(),
            key_fn,
            collector_factory,
            groups: FxHashMap::default(),
            slots,
            out_store_size: 0,
            queue: PropagationQueue::default(),
            label,
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn group_key(&self, tuple: &Tuple) -> Result<(u64, Option<Rc<dyn Fact>>)> {
        match &self.key_fn {
            None => Ok((0, None)),
            Some(f) => {
                let f = f.clone();
                let key_fact = guard_user(&self.label, tuple, || f(tuple))?;
                Ok((key_fact.hash_fact(), Some(key_fact)))
            }
        }
    }

    fn out_facts(key_fact: &Option<Rc<dyn Fact>>, collector: &Option<Box<dyn Collector>>) -> FactVec {
        let mut facts = FactVec::new();
        if let Some(key) = key_fact {
            facts.push(key.clone());
        }
        if let Some(collector) = collector {
            facts.push(collector.result_as_fact());
        }
        facts
    }

    /// Re-derives the output facts and schedules an update when they changed.
    fn refresh_out(&mut self, key_hash: u64, tuples: &mut TupleArena) -> Result<()> {
        let group = self
            .groups
            .get(&key_hash)
            .ok_or_else(|| NetError::consistency_violation("refresh of unknown group"))?;
        let facts = Self::out_facts(&group.key_fact, &group.collector);
        let out = group.out;
        let out_tuple = tuples.get_mut(out)?;
        if Tuple::facts_equal(&out_tuple.facts, &facts) {
            return Ok(());
        }
        out_tuple.facts = facts;
        self.queue.schedule_update(out, tuples.get_mut(out)?)
    }

    fn accumulate(&mut self, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        let (key_hash, key_fact) = self.group_key(tuples.get(index)?)?;
        if let Some(group) = self.groups.get_mut(&key_hash) {
            let receipt = match &mut group.collector {
                Some(collector) => {
                    let tuple = tuples.get(index)?;
                    let receipt = guard_user(&self.label, tuple, {
                        let collector = &mut *collector;
                        move || collector.insert(tuple)
                    })?;
                    receipt
                }
                None => 0,
            };
            group.parent_count += 1;
            let tuple = tuples.get_mut(index)?;
            tuple.set_slot(self.slots.key, Slot::Key(key_hash));
            tuple.set_slot(self.slots.undo, Slot::Undo(receipt));
            self.refresh_out(key_hash, tuples)
        } else {
            // first member founds the group and its output tuple
            let mut collector = self.collector_factory.as_ref().map(|make| make());
            let receipt = match &mut collector {
                Some(collector) => {
                    let tuple = tuples.get(index)?;
                    guard_user(&self.label, tuple, {
                        let collector = &mut **collector;
                        move || collector.insert(tuple)
                    })?
                }
                None => 0,
            };
            let facts = Self::out_facts(&key_fact, &collector);
            let out = tuples.acquire(facts, Some(self.id), self.out_store_size)?;
            self.queue.schedule_insert(out, tuples.get(out)?)?;
            self.groups.insert(
                key_hash,
                Group {
                    key_fact,
                    collector,
                    parent_count: 1,
                    out,
                },
            );
            let tuple = tuples.get_mut(index)?;
            tuple.set_slot(self.slots.key, Slot::Key(key_hash));
            tuple.set_slot(self.slots.undo, Slot::Undo(receipt));
            Ok(())
        }
    }

    fn separate(&mut self, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        let (key_slot, undo_slot) = {
            let tuple = tuples.get_mut(index)?;
            (tuple.take_slot(self.slots.key), tuple.take_slot(self.slots.undo))
        };
        let (Slot::Key(key_hash), Slot::Undo(receipt)) = (key_slot, undo_slot) else {
            return Err(NetError::consistency_violation(
                "group retract without membership slots",
            ));
        };
        let group = self.groups.get_mut(&key_hash).ok_or_else(|| {
            NetError::consistency_violation("group retract for unknown group")
        })?;
        if let Some(collector) = &mut group.collector {
            collector.remove(receipt);
        }
        group.parent_count -= 1;
        if group.parent_count == 0 {
            let out = group.out;
            self.groups.remove(&key_hash);
            self.queue.schedule_retract(out, tuples.get_mut(out)?)
        } else {
            self.refresh_out(key_hash, tuples)
        }
    }

    fn apply(&mut self, op: Op, index: TupleIndex, tuples: &mut TupleArena) -> Result<()> {
        match op {
            Op::Insert => self.accumulate(index, tuples),
            Op::Retract => self.separate(index, tuples),
            Op::Update => {
                // undo the old membership (possibly retiring the old group),
                // then re-accumulate under the freshly computed key
                self.separate(index, tuples)?;
                self.accumulate(index, tuples)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scorer node

/// Terminal node of one constraint: every live input tuple is one match.
/// The undo receipt for each match is kept here (it is typed by the score)
/// and taken back before any re-impact.
pub struct ScorerNode<S: Score> {
    pub constraint: ConstraintRef,
    pub impacter: S::Impacter,
    pub match_weight_fn: MatchWeightFn,
    pub inliner: Rc<RefCell<ScoreInliner<S>>>,
    undo_map: FxHashMap<TupleIndex, UndoImpact<S>>,
}

impl<S: Score> fmt::Debug for ScorerNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScorerNode")
            .field("constraint", &self.constraint.name)
            .field("live_matches", &self.undo_map.len())
            .finish()
    }
}

impl<S: Score> ScorerNode<S> {
    pub fn new(
        constraint: ConstraintRef,
        impacter: S::Impacter,
        match_weight_fn: MatchWeightFn,
        inliner: Rc<RefCell<ScoreInliner<S>>>,
    ) -> Self {
        Self {
            constraint,
            impacter,
            match_weight_fn,
            inliner,
            undo_map: FxHashMap::default(),
        }
    }

    pub fn live_match_count(&self) -> usize {
        self.undo_map.len()
    }

    fn impact(&mut self, index: TupleIndex, tuples: &TupleArena) -> Result<()> {
        let tuple = tuples.get(index)?;
        let weight_fn = self.match_weight_fn.clone();
        let match_weight = guard_user(&self.constraint.name, tuple, || weight_fn(tuple))?;
        let delta = self.impacter.apply(match_weight);
        let undo = self.inliner.borrow_mut().impact(self.constraint.index, delta, || {
            tuple.facts.iter().cloned().collect()
        });
        if self.undo_map.insert(index, undo).is_some() {
            return Err(NetError::consistency_violation(format!(
                "double impact for one tuple in constraint {}",
                self.constraint.name
            )));
        }
        Ok(())
    }

    fn unimpact(&mut self, index: TupleIndex) -> Result<()> {
        let undo = self.undo_map.remove(&index).ok_or_else(|| {
            NetError::consistency_violation(format!(
                "retract of unscored tuple in constraint {}",
                self.constraint.name
            ))
        })?;
        self.inliner.borrow_mut().undo(undo);
        Ok(())
    }

    fn apply(&mut self, op: Op, index: TupleIndex, tuples: &TupleArena) -> Result<()> {
        match op {
            Op::Insert => self.impact(index, tuples),
            Op::Retract => self.unimpact(index),
            Op::Update => {
                self.unimpact(index)?;
                self.impact(index, tuples)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// NodeData dispatch

/// Tagged union of every node kind; the session dispatches commands through
/// it without virtual calls.
#[derive(Debug)]
pub enum NodeData<S: Score> {
    Source(SourceNode),
    Filter(FilterNode),
    Map(MapNode),
    FlatMap(FlatMapNode),
    Join(JoinNode),
    IfExists(IfExistsNode),
    Group(GroupNode),
    Scorer(ScorerNode<S>),
}

impl<S: Score> NodeData<S> {
    pub fn add_child(&mut self, child: ChildRef) {
        match self {
            NodeData::Source(n) => n.children.push(child),
            NodeData::Filter(n) => n.children.push(child),
            NodeData::Map(n) => n.children.push(child),
            NodeData::FlatMap(n) => n.children.push(child),
            NodeData::Join(n) => n.children.push(child),
            NodeData::IfExists(n) => n.children.push(child),
            NodeData::Group(n) => n.children.push(child),
            NodeData::Scorer(_) => {}
        }
    }

    /// Stamps the node's own id; tuple-creating nodes tag their outputs with it.
    pub fn set_id(&mut self, id: NodeId) {
        match self {
            NodeData::Source(n) => n.id = id,
            NodeData::Map(n) => n.id = id,
            NodeData::FlatMap(n) => n.id = id,
            NodeData::Join(n) => n.id = id,
            NodeData::Group(n) => n.id = id,
            NodeData::Filter(_) | NodeData::IfExists(_) | NodeData::Scorer(_) => {}
        }
    }

    /// Processes one command. Pass-through nodes push follow-up commands to
    /// `out`; tuple-creating nodes file their effects in their own queue.
    pub fn apply(
        &mut self,
        side: Side,
        op: Op,
        index: TupleIndex,
        tuples: &mut TupleArena,
        out: &mut Vec<Command>,
    ) -> Result<()> {
        match self {
            NodeData::Source(_) => Err(NetError::consistency_violation(
                "source nodes take no upstream commands",
            )),
            NodeData::Filter(n) => n.apply(op, index, tuples, out),
            NodeData::Map(n) => n.apply(op, index, tuples),
            NodeData::FlatMap(n) => n.apply(op, index, tuples),
            NodeData::Join(n) => n.apply(side, op, index, tuples),
            NodeData::IfExists(n) => n.apply(side, op, index, tuples, out),
            NodeData::Group(n) => n.apply(op, index, tuples),
            NodeData::Scorer(n) => n.apply(op, index, tuples),
        }
    }

    /// Drains one phase of the node's own queue. No-op for queueless kinds.
    pub fn flush(
        &mut self,
        phase: Phase,
        tuples: &mut TupleArena,
        cmds: &mut Vec<Command>,
        release: &mut Vec<TupleIndex>,
    ) -> Result<()> {
        match self {
            NodeData::Source(n) => n.queue.flush(phase, &n.children, tuples, cmds, release),
            NodeData::Map(n) => n.queue.flush(phase, &n.children, tuples, cmds, release),
            NodeData::FlatMap(n) => n.queue.flush(phase, &n.children, tuples, cmds, release),
            NodeData::Join(n) => n.queue.flush(phase, &n.children, tuples, cmds, release),
            NodeData::Group(n) => n.queue.flush(phase, &n.children, tuples, cmds, release),
            NodeData::Filter(_) | NodeData::IfExists(_) | NodeData::Scorer(_) => Ok(()),
        }
    }

    pub fn queue_is_empty(&self) -> bool {
        match self {
            NodeData::Source(n) => n.queue.is_empty(),
            NodeData::Map(n) => n.queue.is_empty(),
            NodeData::FlatMap(n) => n.queue.is_empty(),
            NodeData::Join(n) => n.queue.is_empty(),
            NodeData::Group(n) => n.queue.is_empty(),
            NodeData::Filter(_) | NodeData::IfExists(_) | NodeData::Scorer(_) => true,
        }
    }
}
