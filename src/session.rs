// session.rs - Incremental evaluation session

use crate::arena::{NodeArena, NodeId, TupleArena, TupleIndex};
use crate::error::{NetError, Result};
use crate::fact::Fact;
use crate::inliner::ScoreInliner;
use crate::limits::ResourceLimits;
use crate::nodes::{Command, NodeData, Phase, SourceNode};
use crate::score::Score;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::any::TypeId;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

#[derive(Debug)]
struct FactEntry {
    fact: Rc<dyn Fact>,
    /// The source tuples this fact currently lives in, at most one per
    /// source node of its type.
    tuples: SmallVec<[(NodeId, TupleIndex); 2]>,
}

/// A live evaluation network plus the facts loaded into it.
///
/// `insert`, `update` and `retract` are bookkeeping only; nothing moves
/// through the network until [`Session::calculate_score`] drains the queues.
/// The drain walks the topological layers top-down, and within each layer
/// runs all retracts, then all updates, then all inserts, so no downstream
/// node ever observes a transient double-count.
#[derive(Debug)]
pub struct Session<S: Score> {
    nodes: NodeArena<S>,
    tuples: TupleArena,
    layers: Vec<Vec<NodeId>>,
    sources: FxHashMap<TypeId, SmallVec<[NodeId; 2]>>,
    fact_map: FxHashMap<i64, FactEntry>,
    inliner: Rc<RefCell<ScoreInliner<S>>>,
    limits: ResourceLimits,
}

impl<S: Score> Session<S> {
    pub(crate) fn new(
        nodes: NodeArena<S>,
        layers: Vec<Vec<NodeId>>,
        sources: FxHashMap<TypeId, SmallVec<[NodeId; 2]>>,
        inliner: Rc<RefCell<ScoreInliner<S>>>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            nodes,
            tuples: TupleArena::new(limits.clone()),
            layers,
            sources,
            fact_map: FxHashMap::default(),
            inliner,
            limits,
        }
    }

    fn source_ids<T: Fact>(&self) -> Result<SmallVec<[NodeId; 2]>> {
        self.sources
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| NetError::unregistered_type(std::any::type_name::<T>()))
    }

    // free-standing over the node arena so the tuple arena stays borrowable
    fn source_node(nodes: &mut NodeArena<S>, id: NodeId) -> Result<&mut SourceNode> {
        match nodes.get_mut(id)? {
            NodeData::Source(source) => Ok(source),
            _ => Err(NetError::consistency_violation(
                "source table pointed at a non-source node",
            )),
        }
    }

    /// Loads a fact. Takes effect at the next score calculation.
    pub fn insert<T: Fact>(&mut self, fact: T) -> Result<()> {
        let fact_id = fact.fact_id();
        if self.fact_map.contains_key(&fact_id) {
            return Err(NetError::duplicate_fact(fact_id));
        }
        let source_ids = self.source_ids::<T>()?;
        let rc: Rc<dyn Fact> = Rc::new(fact);
        let mut entry = FactEntry {
            fact: rc.clone(),
            tuples: SmallVec::new(),
        };
        for node_id in source_ids {
            let source = Self::source_node(&mut self.nodes, node_id)?;
            if source.admits(rc.as_ref()) {
                let index = source.insert_fact(rc.clone(), &mut self.tuples)?;
                entry.tuples.push((node_id, index));
            }
        }
        trace!(fact_id, sources = entry.tuples.len(), "fact inserted");
        self.fact_map.insert(fact_id, entry);
        Ok(())
    }

    /// Replaces the fact with the same id. The new value may move the fact
    /// in or out of a source that filters on assignedness.
    pub fn update<T: Fact>(&mut self, fact: T) -> Result<()> {
        let fact_id = fact.fact_id();
        let source_ids = self.source_ids::<T>()?;
        let mut placements = self
            .fact_map
            .get(&fact_id)
            .ok_or_else(|| NetError::fact_not_found(fact_id))?
            .tuples
            .clone();
        let rc: Rc<dyn Fact> = Rc::new(fact);
        for node_id in source_ids {
            let existing = placements.iter().position(|(n, _)| *n == node_id);
            let source = Self::source_node(&mut self.nodes, node_id)?;
            let admits = source.admits(rc.as_ref());
            match (existing, admits) {
                (Some(pos), true) => {
                    let index = placements[pos].1;
                    source.update_fact(index, rc.clone(), &mut self.tuples)?;
                }
                (Some(pos), false) => {
                    let (_, index) = placements.remove(pos);
                    source.retract_fact(index, &mut self.tuples)?;
                }
                (None, true) => {
                    let index = source.insert_fact(rc.clone(), &mut self.tuples)?;
                    placements.push((node_id, index));
                }
                (None, false) => {}
            }
        }
        if let Some(entry) = self.fact_map.get_mut(&fact_id) {
            entry.fact = rc;
            entry.tuples = placements;
        }
        trace!(fact_id, "fact updated");
        Ok(())
    }

    pub fn retract<T: Fact>(&mut self, fact: &T) -> Result<()> {
        self.retract_by_id(fact.fact_id())
    }

    pub fn retract_by_id(&mut self, fact_id: i64) -> Result<()> {
        let entry = self
            .fact_map
            .remove(&fact_id)
            .ok_or_else(|| NetError::fact_not_found(fact_id))?;
        for (node_id, index) in entry.tuples {
            Self::source_node(&mut self.nodes, node_id)?
                .retract_fact(index, &mut self.tuples)?;
        }
        trace!(fact_id, "fact retracted");
        Ok(())
    }

    /// Retracts every loaded fact and settles the network back to empty.
    pub fn clear(&mut self) -> Result<()> {
        let ids: Vec<i64> = self.fact_map.keys().copied().collect();
        for id in ids {
            self.retract_by_id(id)?;
        }
        self.drain()
    }

    /// Propagates all pending changes and returns the current score.
    /// `init_score` is the caller's count of uninitialized planning
    /// variables, attached to the score unchanged.
    pub fn calculate_score(&mut self, init_score: i32) -> Result<S> {
        self.drain()?;
        Ok(self.inliner.borrow().extract_score(init_score))
    }

    fn drain(&mut self) -> Result<()> {
        let mut dispatched: usize = 0;
        for layer in 0..self.layers.len() {
            for phase in [Phase::Retract, Phase::Update, Phase::Insert] {
                let mut cmds: Vec<Command> = Vec::new();
                let mut release: Vec<TupleIndex> = Vec::new();
                for i in 0..self.layers[layer].len() {
                    let node = self.layers[layer][i];
                    self.nodes.get_mut(node)?.flush(
                        phase,
                        &mut self.tuples,
                        &mut cmds,
                        &mut release,
                    )?;
                }
                // worklist: pass-through nodes push follow-ups onto the tail
                let mut next = 0;
                while next < cmds.len() {
                    dispatched += 1;
                    self.limits.check_command_count(dispatched)?;
                    let cmd = cmds[next];
                    next += 1;
                    self.nodes.get_mut(cmd.target)?.apply(
                        cmd.side,
                        cmd.op,
                        cmd.tuple,
                        &mut self.tuples,
                        &mut cmds,
                    )?;
                }
                // dying tuples leave the arena only after every consumer
                // has seen the retract
                for index in release {
                    self.tuples.release(index)?;
                }
            }
        }
        #[cfg(debug_assertions)]
        self.tuples.check_for_dirty_tuples()?;
        trace!(commands = dispatched, tuples = self.tuples.len(), "drain complete");
        Ok(())
    }

    /// Per-constraint score totals. Current as of the last drain.
    pub fn constraint_totals(&self) -> Vec<(String, S)> {
        self.inliner
            .borrow()
            .constraint_match_totals()
            .iter()
            .map(|t| (t.constraint.name.to_string(), t.score.clone()))
            .collect()
    }

    pub fn constraint_names(&self) -> Vec<String> {
        self.inliner
            .borrow()
            .constraint_match_totals()
            .iter()
            .map(|t| t.constraint.name.to_string())
            .collect()
    }

    /// Per-fact blame, keyed by fact id. Empty unless the session was built
    /// with match tracking.
    pub fn indictments(&self) -> FxHashMap<i64, S> {
        self.inliner.borrow().indictments()
    }

    pub fn get_fact(&self, fact_id: i64) -> Option<Rc<dyn Fact>> {
        self.fact_map.get(&fact_id).map(|e| e.fact.clone())
    }

    pub fn fact_count(&self) -> usize {
        self.fact_map.len()
    }

    pub fn tuple_count(&self) -> usize {
        self.tuples.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ConstraintBuilder;
    use crate::collectors::Collectors;
    use crate::score::{HardSoftScore, SimpleScore};
    use crate::tuple::Tuple;
    use std::any::Any;

    #[derive(Debug, Clone, PartialEq)]
    struct Shift {
        id: i64,
        employee: Option<i64>,
        day: i64,
    }

    impl Fact for Shift {
        fn fact_id(&self) -> i64 {
            self.id
        }
        fn clone_fact(&self) -> Box<dyn Fact> {
            Box::new(self.clone())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Employee {
        id: i64,
    }

    impl Fact for Employee {
        fn fact_id(&self) -> i64 {
            self.id
        }
        fn clone_fact(&self) -> Box<dyn Fact> {
            Box::new(self.clone())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn shift(id: i64, employee: Option<i64>, day: i64) -> Shift {
        Shift { id, employee, day }
    }

    fn shift_of(t: &Tuple) -> &Shift {
        t.fact::<Shift>(0).unwrap()
    }

    #[test]
    fn filter_constraint_tracks_insert_update_retract() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each_including_unassigned::<Shift>()
            .filter(|t| shift_of(t).day > 5)
            .penalize("late in the week", SimpleScore::of(1));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, None, 3)).unwrap();
        session.insert(shift(2, None, 7)).unwrap();
        session.insert(shift(3, None, 9)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-2));

        // moving shift 2 earlier releases its penalty
        session.update(shift(2, None, 2)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-1));

        session.retract(&shift(3, None, 9)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::zero());

        session.insert(shift(4, None, 6)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-1));
    }

    #[test]
    fn incremental_score_matches_from_scratch_evaluation() {
        let build = || {
            let builder = ConstraintBuilder::<SimpleScore>::new();
            builder
                .for_each_including_unassigned::<Shift>()
                .filter(|t| shift_of(t).day > 5)
                .penalize("late in the week", SimpleScore::of(1));
            builder.build().unwrap()
        };

        let mut incremental = build();
        incremental.insert(shift(1, None, 8)).unwrap();
        incremental.insert(shift(2, None, 2)).unwrap();
        incremental.insert(shift(3, None, 9)).unwrap();
        incremental.calculate_score(0).unwrap();
        incremental.update(shift(2, None, 7)).unwrap();
        incremental.retract_by_id(3).unwrap();
        incremental.insert(shift(4, None, 1)).unwrap();
        let incremental_score = incremental.calculate_score(0).unwrap();

        let mut fresh = build();
        fresh.insert(shift(1, None, 8)).unwrap();
        fresh.insert(shift(2, None, 7)).unwrap();
        fresh.insert(shift(4, None, 1)).unwrap();
        assert_eq!(fresh.calculate_score(0).unwrap(), incremental_score);
    }

    #[test]
    fn batched_retract_and_insert_never_meet_across_a_join() {
        let calls = Rc::new(RefCell::new(0usize));
        let seen = calls.clone();

        let builder = ConstraintBuilder::<SimpleScore>::new();
        let shifts = builder.for_each_including_unassigned::<Shift>();
        let employees = builder.for_each_including_unassigned::<Employee>();
        shifts
            .join(
                &employees,
                |t| shift_of(t).employee.map(|e| e as u64),
                |t| Some(t.fact::<Employee>(0).unwrap().id as u64),
            )
            .penalize_each("assigned", SimpleScore::of(1), move |_| {
                *seen.borrow_mut() += 1;
                1
            });
        let mut session = builder.build().unwrap();

        session.insert(shift(1, Some(7), 1)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::zero());

        // the shift leaves and its employee arrives in the same batch: the
        // retract phase clears the left index before the insert phase probes
        // it, so the pair never forms and the weight function never runs
        session.retract_by_id(1).unwrap();
        session.insert(Employee { id: 7 }).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::zero());
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn insert_then_retract_before_drain_leaves_score_unchanged() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each_including_unassigned::<Shift>()
            .filter(|t| shift_of(t).day > 5)
            .penalize("late in the week", SimpleScore::of(1));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, None, 9)).unwrap();
        let baseline = session.calculate_score(0).unwrap();
        assert_eq!(baseline, SimpleScore::of(-1));

        // a fact that comes and goes within one batch is never scored
        session.insert(shift(2, None, 8)).unwrap();
        session.retract_by_id(2).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), baseline);
        assert_eq!(session.fact_count(), 1);
    }

    #[test]
    fn self_join_finds_double_bookings() {
        let builder = ConstraintBuilder::<HardSoftScore>::new();
        let shifts = builder.for_each_including_unassigned::<Shift>();
        shifts
            .join_filtered(
                &shifts,
                |t| shift_of(t).employee.map(|e| e as u64),
                |t| shift_of(t).employee.map(|e| e as u64),
                |pair| {
                    let a = pair.fact::<Shift>(0).unwrap();
                    let b = pair.fact::<Shift>(1).unwrap();
                    a.day == b.day && a.id < b.id
                },
            )
            .penalize("double booking", HardSoftScore::of_hard(1));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, Some(10), 1)).unwrap();
        session.insert(shift(2, Some(10), 1)).unwrap();
        assert_eq!(
            session.calculate_score(0).unwrap(),
            HardSoftScore::of_hard(-1)
        );

        // moving shift 2 to another day clears the conflict
        session.update(shift(2, Some(10), 4)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), HardSoftScore::zero());

        // a third shift collides with both existing days
        session.insert(shift(3, Some(10), 1)).unwrap();
        session.insert(shift(4, Some(10), 4)).unwrap();
        assert_eq!(
            session.calculate_score(0).unwrap(),
            HardSoftScore::of_hard(-2)
        );

        // unassigned shifts never join
        session.insert(shift(5, None, 1)).unwrap();
        assert_eq!(
            session.calculate_score(0).unwrap(),
            HardSoftScore::of_hard(-2)
        );
    }

    #[test]
    fn group_count_over_threshold() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each_including_unassigned::<Shift>()
            .group_by(
                |t| Rc::new(shift_of(t).employee.unwrap_or(-1)),
                Collectors::count(),
            )
            .filter(|t| *t.fact::<i64>(1).unwrap() > 2)
            .penalize("overloaded employee", SimpleScore::of(1));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, Some(7), 1)).unwrap();
        session.insert(shift(2, Some(7), 2)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::zero());

        // third shift pushes employee 7 over the limit
        session.insert(shift(3, Some(7), 3)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-1));

        // a different employee grows their own group
        session.insert(shift(4, Some(8), 1)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-1));

        // back under the limit retracts the group's penalty
        session.retract_by_id(2).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::zero());

        // the last member's departure retires the group entirely
        session.retract_by_id(1).unwrap();
        session.retract_by_id(3).unwrap();
        session.retract_by_id(4).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::zero());
        assert_eq!(session.tuple_count(), 0);
    }

    #[test]
    fn if_not_exists_penalizes_unknown_employee() {
        let builder = ConstraintBuilder::<HardSoftScore>::new();
        let shifts = builder.for_each_including_unassigned::<Shift>();
        let employees = builder.for_each_including_unassigned::<Employee>();
        shifts
            .if_not_exists(
                &employees,
                |t| shift_of(t).employee.map(|e| e as u64),
                |t| Some(t.fact::<Employee>(0).unwrap().id as u64),
            )
            .penalize("unknown employee", HardSoftScore::of_hard(1));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, Some(42), 1)).unwrap();
        assert_eq!(
            session.calculate_score(0).unwrap(),
            HardSoftScore::of_hard(-1)
        );

        // registering the employee satisfies the constraint
        session.insert(Employee { id: 42 }).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), HardSoftScore::zero());

        session.retract(&Employee { id: 42 }).unwrap();
        assert_eq!(
            session.calculate_score(0).unwrap(),
            HardSoftScore::of_hard(-1)
        );
    }

    #[test]
    fn assignedness_moves_facts_between_sources() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder.register_assigned::<Shift>(|s| s.employee.is_some());
        builder
            .for_each::<Shift>()
            .penalize("assigned shift", SimpleScore::of(1));
        builder
            .for_each_including_unassigned::<Shift>()
            .filter(|t| shift_of(t).employee.is_none())
            .penalize("unassigned shift", SimpleScore::of(10));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, None, 1)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-10));

        // assignment migrates the fact into the filtered source
        session.update(shift(1, Some(3), 1)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-1));

        session.update(shift(1, None, 1)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-10));
    }

    #[test]
    fn shared_stream_evaluates_predicate_once() {
        let calls = Rc::new(RefCell::new(0usize));
        let builder = ConstraintBuilder::<SimpleScore>::new();
        let counted = {
            let calls = calls.clone();
            builder
                .for_each_including_unassigned::<Shift>()
                .filter(move |t| {
                    *calls.borrow_mut() += 1;
                    shift_of(t).day > 0
                })
        };
        counted.penalize("first", SimpleScore::of(1));
        counted.penalize("second", SimpleScore::of(2));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, None, 3)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-3));
        // one filter node serves both constraints
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn clear_settles_back_to_empty() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        let shifts = builder.for_each_including_unassigned::<Shift>();
        shifts
            .join(
                &shifts,
                |t| Some(shift_of(t).day as u64),
                |t| Some(shift_of(t).day as u64),
            )
            .penalize("same day pair", SimpleScore::of(1));
        let mut session = builder.build().unwrap();

        for id in 0..6 {
            session.insert(shift(id, Some(id), id % 2)).unwrap();
        }
        assert!(session.calculate_score(0).unwrap() < SimpleScore::zero());

        session.clear().unwrap();
        assert_eq!(session.fact_count(), 0);
        assert_eq!(session.tuple_count(), 0);
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::zero());
    }

    #[test]
    fn duplicate_and_missing_facts_are_rejected() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each_including_unassigned::<Shift>()
            .penalize("any shift", SimpleScore::of(1));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, None, 1)).unwrap();
        assert!(matches!(
            session.insert(shift(1, None, 2)),
            Err(NetError::DuplicateFact(1))
        ));
        assert!(matches!(
            session.retract_by_id(99),
            Err(NetError::FactNotFound(99))
        ));
        assert!(session.update(shift(2, None, 1)).is_err());
        // unregistered fact types are refused outright
        assert!(session.insert(Employee { id: 5 }).is_err());
    }

    #[test]
    fn match_tracking_exposes_indictments() {
        let builder = ConstraintBuilder::<HardSoftScore>::new().with_match_tracking(true);
        builder
            .for_each_including_unassigned::<Shift>()
            .filter(|t| shift_of(t).day > 5)
            .penalize("late in the week", HardSoftScore::of_soft(2));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, None, 9)).unwrap();
        session.insert(shift(2, None, 3)).unwrap();
        session.calculate_score(0).unwrap();

        let indictments = session.indictments();
        assert_eq!(indictments.get(&1), Some(&HardSoftScore::of_soft(-2)));
        assert!(!indictments.contains_key(&2));

        let totals = session.constraint_totals();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].1, HardSoftScore::of_soft(-2));
    }

    #[test]
    fn match_weight_scales_the_impact() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each_including_unassigned::<Shift>()
            .penalize_each("day weight", SimpleScore::of(1), |t| shift_of(t).day);
        let mut session = builder.build().unwrap();

        session.insert(shift(1, None, 4)).unwrap();
        session.insert(shift(2, None, 6)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-10));

        session.update(shift(2, None, 1)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-5));
    }

    #[test]
    fn flat_map_expands_and_contracts() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each_including_unassigned::<Shift>()
            .flat_map(|t| {
                let shift = shift_of(t);
                (0..shift.day)
                    .map(|d| {
                        let mut facts = crate::tuple::FactVec::new();
                        facts.push(Rc::new(d) as Rc<dyn Fact>);
                        facts
                    })
                    .collect()
            })
            .penalize("per day", SimpleScore::of(1));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, None, 3)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-3));

        session.update(shift(1, None, 1)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-1));

        session.retract_by_id(1).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::zero());
        assert_eq!(session.tuple_count(), 0);
    }

    #[test]
    fn map_reshapes_tuples() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each_including_unassigned::<Shift>()
            .map(|t| {
                let mut facts = crate::tuple::FactVec::new();
                facts.push(Rc::new(shift_of(t).day * 2) as Rc<dyn Fact>);
                facts
            })
            .filter(|t| *t.fact::<i64>(0).unwrap() > 4)
            .penalize("doubled day", SimpleScore::of(1));
        let mut session = builder.build().unwrap();

        session.insert(shift(1, None, 2)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::zero());

        session.update(shift(1, None, 3)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(-1));
    }

    #[test]
    fn init_score_rides_along_unchanged() {
        let builder = ConstraintBuilder::<HardSoftScore>::new();
        builder
            .for_each_including_unassigned::<Shift>()
            .penalize("any", HardSoftScore::of_soft(1));
        let mut session = builder.build().unwrap();
        session.insert(shift(1, None, 1)).unwrap();

        let score = session.calculate_score(-2).unwrap();
        assert_eq!(score.init, -2);
        assert!(!score.is_feasible());
        let score = session.calculate_score(0).unwrap();
        assert_eq!(score, HardSoftScore::of_soft(-1));
    }
}
