// inliner.rs - Session-wide score accumulation with exact undo

use crate::fact::Fact;
use crate::score::Score;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Identifies a constraint inside one session.
#[derive(Debug, Clone)]
pub struct ConstraintRef {
    pub index: usize,
    pub name: Rc<str>,
}

/// Receipt for one score impact. Undoing it subtracts exactly the delta that
/// was added, so impact followed by undo is a net zero on the totals.
#[derive(Debug)]
pub struct UndoImpact<S> {
    constraint: usize,
    delta: S,
    match_id: Option<u64>,
}

/// One recorded constraint match (only kept under match tracking).
#[derive(Debug, Clone)]
pub struct ConstraintMatch<S> {
    pub score: S,
    pub facts: Vec<Rc<dyn Fact>>,
}

/// Per-constraint running totals plus the live matches under tracking.
#[derive(Debug)]
pub struct ConstraintMatchTotal<S> {
    pub constraint: ConstraintRef,
    pub weight: S,
    pub score: S,
    pub matches: FxHashMap<u64, ConstraintMatch<S>>,
}

/// Accumulates weighted score deltas for every constraint of a session.
///
/// The scorer nodes feed it; nothing else writes to it. Constraint-match
/// tracking is decided at session build time because recording matches costs
/// an allocation per live match.
#[derive(Debug)]
pub struct ScoreInliner<S: Score> {
    total: S,
    match_tracking: bool,
    totals: Vec<ConstraintMatchTotal<S>>,
    next_match_id: u64,
}

impl<S: Score> ScoreInliner<S> {
    pub fn new(match_tracking: bool) -> Self {
        Self {
            total: S::zero(),
            match_tracking,
            totals: Vec::new(),
            next_match_id: 0,
        }
    }

    pub fn match_tracking(&self) -> bool {
        self.match_tracking
    }

    /// Registers a constraint and returns its reference. Build time only.
    pub fn register_constraint(&mut self, name: &str, weight: S) -> ConstraintRef {
        let constraint = ConstraintRef {
            index: self.totals.len(),
            name: Rc::from(name),
        };
        self.totals.push(ConstraintMatchTotal {
            constraint: constraint.clone(),
            weight,
            score: S::zero(),
            matches: FxHashMap::default(),
        });
        constraint
    }

    /// Adds `delta` for `constraint` and returns the receipt to take it back.
    /// `facts` is only rendered under match tracking.
    pub fn impact(
        &mut self,
        constraint: usize,
        delta: S,
        facts: impl FnOnce() -> Vec<Rc<dyn Fact>>,
    ) -> UndoImpact<S> {
        self.total = self.total.clone() + delta.clone();
        let entry = &mut self.totals[constraint];
        entry.score = entry.score.clone() + delta.clone();
        let match_id = if self.match_tracking {
            let id = self.next_match_id;
            self.next_match_id += 1;
            entry.matches.insert(
                id,
                ConstraintMatch {
                    score: delta.clone(),
                    facts: facts(),
                },
            );
            Some(id)
        } else {
            None
        };
        UndoImpact {
            constraint,
            delta,
            match_id,
        }
    }

    /// Reverts one impact exactly.
    pub fn undo(&mut self, undo: UndoImpact<S>) {
        self.total = self.total.clone() - undo.delta.clone();
        let entry = &mut self.totals[undo.constraint];
        entry.score = entry.score.clone() - undo.delta;
        if let Some(id) = undo.match_id {
            entry.matches.remove(&id);
        }
    }

    /// Folds the running totals into the canonical score, attaching the
    /// uninitialized-variable count supplied by the caller.
    pub fn extract_score(&self, init_score: i32) -> S {
        self.total.clone().with_init(init_score)
    }

    pub fn constraint_match_totals(&self) -> &[ConstraintMatchTotal<S>] {
        &self.totals
    }

    /// Per-fact blame map: for every fact appearing in a recorded match, the
    /// sum of the match scores it participates in. Empty without tracking.
    pub fn indictments(&self) -> FxHashMap<i64, S> {
        let mut map: FxHashMap<i64, S> = FxHashMap::default();
        for total in &self.totals {
            for m in total.matches.values() {
                for fact in &m.facts {
                    let entry = map.entry(fact.fact_id()).or_insert_with(S::zero);
                    *entry = entry.clone() + m.score.clone();
                }
            }
        }
        map
    }
}
