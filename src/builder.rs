// builder.rs - Fluent constraint-definition API

use crate::collectors::CollectorFactory;
use crate::error::Result;
use crate::fact::Fact;
use crate::factory::NetworkFactory;
use crate::limits::ResourceLimits;
use crate::score::Score;
use crate::session::Session;
use crate::stream_def::{ConstraintDef, FunctionId, FunctionRegistry, StreamDef};
use crate::tuple::{FactVec, Tuple};
use std::cell::RefCell;
use std::rc::Rc;

struct BuilderCore<S: Score> {
    registry: FunctionRegistry,
    constraints: Vec<ConstraintDef<S>>,
    unit_weight: Option<FunctionId>,
}

impl<S: Score> BuilderCore<S> {
    fn unit_weight(&mut self) -> FunctionId {
        if let Some(id) = self.unit_weight {
            return id;
        }
        let id = self.registry.register_weight(Rc::new(|_: &Tuple| 1));
        self.unit_weight = Some(id);
        id
    }
}

/// Collects constraint definitions and builds the session.
///
/// Streams created from one builder may be cloned and reused freely;
/// structurally identical stream stages share one node in the built network.
pub struct ConstraintBuilder<S: Score> {
    core: Rc<RefCell<BuilderCore<S>>>,
    match_tracking: bool,
    limits: ResourceLimits,
}

impl<S: Score> Default for ConstraintBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Score> ConstraintBuilder<S> {
    pub fn new() -> Self {
        Self {
            core: Rc::new(RefCell::new(BuilderCore {
                registry: FunctionRegistry::new(),
                constraints: Vec::new(),
                unit_weight: None,
            })),
            match_tracking: false,
            limits: ResourceLimits::default(),
        }
    }

    /// Enables per-match recording: constraint matches and indictments
    /// become queryable at the cost of one allocation per live match.
    pub fn with_match_tracking(mut self, on: bool) -> Self {
        self.match_tracking = on;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Declares how to tell assigned facts of `T` from unassigned ones.
    /// Without a registered test every fact of `T` counts as assigned.
    pub fn register_assigned<T: Fact>(&self, test: impl Fn(&T) -> bool + 'static) {
        self.core.borrow_mut().registry.register_assigned(
            std::any::TypeId::of::<T>(),
            Rc::new(move |fact| fact.as_any().downcast_ref::<T>().map_or(false, &test)),
        );
    }

    fn source<T: Fact>(&self, include_unassigned: bool) -> Stream<S> {
        Stream {
            core: self.core.clone(),
            def: Rc::new(StreamDef::Source {
                fact_type: std::any::TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                include_unassigned,
            }),
        }
    }

    /// Stream of every assigned fact of `T`.
    pub fn for_each<T: Fact>(&self) -> Stream<S> {
        self.source::<T>(false)
    }

    /// Stream of every fact of `T`, assigned or not.
    pub fn for_each_including_unassigned<T: Fact>(&self) -> Stream<S> {
        self.source::<T>(true)
    }

    pub fn build(self) -> Result<Session<S>> {
        let (registry, constraints) = {
            let mut core = self.core.borrow_mut();
            (
                std::mem::take(&mut core.registry),
                std::mem::take(&mut core.constraints),
            )
        };
        NetworkFactory::new(registry, constraints, self.match_tracking, self.limits).build()
    }
}

/// One stage of a constraint stream. Cheap to clone; cloning preserves
/// structural identity, so a cloned stream shares nodes with its original.
pub struct Stream<S: Score> {
    core: Rc<RefCell<BuilderCore<S>>>,
    def: Rc<StreamDef>,
}

impl<S: Score> Clone for Stream<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            def: self.def.clone(),
        }
    }
}

impl<S: Score> Stream<S> {
    fn derived(&self, def: StreamDef) -> Stream<S> {
        Stream {
            core: self.core.clone(),
            def: Rc::new(def),
        }
    }

    pub fn filter(&self, predicate: impl Fn(&Tuple) -> bool + 'static) -> Stream<S> {
        let predicate = self
            .core
            .borrow_mut()
            .registry
            .register_predicate(Rc::new(predicate));
        self.derived(StreamDef::Filter {
            parent: self.def.clone(),
            predicate,
        })
    }

    /// Equality join; the combined tuple carries this stream's facts
    /// followed by `other`'s. Unassigned keys (`None`) never match.
    pub fn join(
        &self,
        other: &Stream<S>,
        left_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        right_key: impl Fn(&Tuple) -> Option<u64> + 'static,
    ) -> Stream<S> {
        self.join_inner(other, left_key, right_key, None)
    }

    /// Equality join with a residual predicate over the combined tuple.
    pub fn join_filtered(
        &self,
        other: &Stream<S>,
        left_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        right_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        residual: impl Fn(&Tuple) -> bool + 'static,
    ) -> Stream<S> {
        self.join_inner(other, left_key, right_key, Some(Rc::new(residual)))
    }

    fn join_inner(
        &self,
        other: &Stream<S>,
        left_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        right_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        residual: Option<Rc<dyn Fn(&Tuple) -> bool>>,
    ) -> Stream<S> {
        let mut core = self.core.borrow_mut();
        let left_key = core.registry.register_key(Rc::new(left_key));
        let right_key = core.registry.register_key(Rc::new(right_key));
        let residual = residual.map(|r| core.registry.register_predicate(r));
        drop(core);
        self.derived(StreamDef::Join {
            left: self.def.clone(),
            right: other.def.clone(),
            left_key,
            right_key,
            residual,
        })
    }

    fn exists_inner(
        &self,
        other: &Stream<S>,
        should_exist: bool,
        include_unassigned: bool,
        left_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        right_key: impl Fn(&Tuple) -> Option<u64> + 'static,
    ) -> Stream<S> {
        let mut core = self.core.borrow_mut();
        let left_key = core.registry.register_key(Rc::new(left_key));
        let right_key = core.registry.register_key(Rc::new(right_key));
        drop(core);
        self.derived(StreamDef::IfExists {
            left: self.def.clone(),
            right: other.def.clone(),
            should_exist,
            include_unassigned,
            left_key,
            right_key,
        })
    }

    /// Keeps tuples for which a matching tuple exists in `other`.
    pub fn if_exists(
        &self,
        other: &Stream<S>,
        left_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        right_key: impl Fn(&Tuple) -> Option<u64> + 'static,
    ) -> Stream<S> {
        self.exists_inner(other, true, false, left_key, right_key)
    }

    /// Keeps tuples for which no matching tuple exists in `other`.
    pub fn if_not_exists(
        &self,
        other: &Stream<S>,
        left_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        right_key: impl Fn(&Tuple) -> Option<u64> + 'static,
    ) -> Stream<S> {
        self.exists_inner(other, false, false, left_key, right_key)
    }

    /// Like [`Stream::if_exists`], but an unassigned key counts as a
    /// trivial match.
    pub fn if_exists_including_unassigned(
        &self,
        other: &Stream<S>,
        left_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        right_key: impl Fn(&Tuple) -> Option<u64> + 'static,
    ) -> Stream<S> {
        self.exists_inner(other, true, true, left_key, right_key)
    }

    /// Like [`Stream::if_not_exists`], but an unassigned key counts as a
    /// trivial match.
    pub fn if_not_exists_including_unassigned(
        &self,
        other: &Stream<S>,
        left_key: impl Fn(&Tuple) -> Option<u64> + 'static,
        right_key: impl Fn(&Tuple) -> Option<u64> + 'static,
    ) -> Stream<S> {
        self.exists_inner(other, false, true, left_key, right_key)
    }

    /// Groups by key and aggregates members; the output tuple carries the
    /// key fact followed by the aggregate fact.
    pub fn group_by(
        &self,
        key: impl Fn(&Tuple) -> Rc<dyn Fact> + 'static,
        collector: CollectorFactory,
    ) -> Stream<S> {
        let mut core = self.core.borrow_mut();
        let key_fn = Some(core.registry.register_group_key(Rc::new(key)));
        let collector = Some(core.registry.register_collector(collector));
        drop(core);
        self.derived(StreamDef::Group {
            parent: self.def.clone(),
            key_fn,
            collector,
        })
    }

    /// Distinct keys: one output tuple per distinct key, no aggregate.
    pub fn group_by_key(&self, key: impl Fn(&Tuple) -> Rc<dyn Fact> + 'static) -> Stream<S> {
        let key_fn = Some(
            self.core
                .borrow_mut()
                .registry
                .register_group_key(Rc::new(key)),
        );
        self.derived(StreamDef::Group {
            parent: self.def.clone(),
            key_fn,
            collector: None,
        })
    }

    /// Aggregates the whole stream into a single output tuple.
    pub fn aggregate(&self, collector: CollectorFactory) -> Stream<S> {
        let collector = Some(self.core.borrow_mut().registry.register_collector(collector));
        self.derived(StreamDef::Group {
            parent: self.def.clone(),
            key_fn: None,
            collector,
        })
    }

    pub fn map(&self, mapper: impl Fn(&Tuple) -> FactVec + 'static) -> Stream<S> {
        let mapper = self
            .core
            .borrow_mut()
            .registry
            .register_mapper(Rc::new(mapper));
        self.derived(StreamDef::Map {
            parent: self.def.clone(),
            mapper,
        })
    }

    pub fn flat_map(&self, expander: impl Fn(&Tuple) -> Vec<FactVec> + 'static) -> Stream<S> {
        let expander = self
            .core
            .borrow_mut()
            .registry
            .register_expander(Rc::new(expander));
        self.derived(StreamDef::FlatMap {
            parent: self.def.clone(),
            expander,
        })
    }

    fn terminate(&self, name: &str, weight: S, match_weight: FunctionId) {
        self.core.borrow_mut().constraints.push(ConstraintDef {
            name: name.to_string(),
            weight,
            stream: self.def.clone(),
            match_weight,
        });
    }

    /// Subtracts `weight` from the score for every tuple in this stream.
    pub fn penalize(&self, name: &str, weight: S) {
        let unit = self.core.borrow_mut().unit_weight();
        self.terminate(name, S::zero() - weight, unit);
    }

    /// Like [`Stream::penalize`], with a per-match weight multiplier.
    pub fn penalize_each(
        &self,
        name: &str,
        weight: S,
        match_weight: impl Fn(&Tuple) -> i64 + 'static,
    ) {
        let id = self
            .core
            .borrow_mut()
            .registry
            .register_weight(Rc::new(match_weight));
        self.terminate(name, S::zero() - weight, id);
    }

    /// Adds `weight` to the score for every tuple in this stream.
    pub fn reward(&self, name: &str, weight: S) {
        let unit = self.core.borrow_mut().unit_weight();
        self.terminate(name, weight, unit);
    }

    /// Like [`Stream::reward`], with a per-match weight multiplier.
    pub fn reward_each(
        &self,
        name: &str,
        weight: S,
        match_weight: impl Fn(&Tuple) -> i64 + 'static,
    ) {
        let id = self
            .core
            .borrow_mut()
            .registry
            .register_weight(Rc::new(match_weight));
        self.terminate(name, weight, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::SimpleScore;
    use std::any::Any;

    #[derive(Debug, Clone)]
    struct Value(i64);

    impl Fact for Value {
        fn fact_id(&self) -> i64 {
            self.0
        }
        fn clone_fact(&self) -> Box<dyn Fact> {
            Box::new(self.clone())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn cloned_streams_share_structure() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        let stream = builder
            .for_each_including_unassigned::<Value>()
            .filter(|_| true);
        let cloned = stream.clone();
        assert_eq!(stream.def, cloned.def);
    }

    #[test]
    fn separate_filter_calls_are_distinct_stages() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        let source = builder.for_each_including_unassigned::<Value>();
        let a = source.filter(|_| true);
        let b = source.filter(|_| true);
        // each call registers its own closure, so the stages differ
        assert_ne!(a.def, b.def);
    }

    #[test]
    fn assigned_and_unassigned_sources_differ() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        let assigned = builder.for_each::<Value>();
        let all = builder.for_each_including_unassigned::<Value>();
        assert_ne!(assigned.def, all.def);
    }

    #[test]
    fn reward_and_penalty_use_opposite_signs() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        let source = builder.for_each_including_unassigned::<Value>();
        source.penalize("down", SimpleScore::of(2));
        source.reward("up", SimpleScore::of(3));
        let mut session = builder.build().unwrap();
        session.insert(Value(1)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(1));
    }

    #[test]
    fn rewarding_each_scales_by_match_weight() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each_including_unassigned::<Value>()
            .reward_each("value", SimpleScore::of(1), |t| t.fact::<Value>(0).unwrap().0);
        let mut session = builder.build().unwrap();
        session.insert(Value(4)).unwrap();
        session.insert(Value(6)).unwrap();
        assert_eq!(session.calculate_score(0).unwrap(), SimpleScore::of(10));
    }
}
