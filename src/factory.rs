// factory.rs - Builds the node network from constraint definitions

use crate::arena::{NodeArena, NodeId};
use crate::error::{NetError, Result};
use crate::inliner::ScoreInliner;
use crate::limits::ResourceLimits;
use crate::nodes::{
    ChildRef, ExistsLeftSlots, ExistsRightSlots, FilterNode, FlatMapNode, GroupNode, GroupSlots,
    IfExistsNode, JoinNode, JoinSlots, MapNode, NodeData, ScorerNode, Side, SourceNode,
};
use crate::score::Score;
use crate::session::Session;
use crate::stream_def::{ConstraintDef, FunctionRegistry, StreamDef};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::any::TypeId;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Turns declared constraints into a session. Structurally identical stream
/// definitions are built once and shared; the rest is wiring: topological
/// layers for the drain order and scratch-slot layouts on the tuple stores.
pub struct NetworkFactory<S: Score> {
    registry: FunctionRegistry,
    constraints: Vec<ConstraintDef<S>>,
    match_tracking: bool,
    limits: ResourceLimits,
    nodes: NodeArena<S>,
    built: FxHashMap<StreamDef, NodeId>,
    layer_of: FxHashMap<NodeId, usize>,
    slot_counters: FxHashMap<StreamDef, usize>,
    sources: FxHashMap<TypeId, SmallVec<[NodeId; 2]>>,
}

impl<S: Score> NetworkFactory<S> {
    pub fn new(
        registry: FunctionRegistry,
        constraints: Vec<ConstraintDef<S>>,
        match_tracking: bool,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            registry,
            constraints,
            match_tracking,
            limits,
            nodes: NodeArena::new(),
            built: FxHashMap::default(),
            layer_of: FxHashMap::default(),
            slot_counters: FxHashMap::default(),
            sources: FxHashMap::default(),
        }
    }

    /// Reserves `count` scratch slots on the tuples of `source` and returns
    /// the first index of the reserved range.
    fn reserve_slots(&mut self, source: &Rc<StreamDef>, count: usize) -> usize {
        let counter = self
            .slot_counters
            .entry(source.as_ref().clone())
            .or_insert(0);
        let base = *counter;
        *counter += count;
        base
    }

    fn insert_node(&mut self, def: &Rc<StreamDef>, node: NodeData<S>, layer: usize) -> NodeId {
        let id = self.nodes.insert(node);
        if let Ok(node) = self.nodes.get_mut(id) {
            node.set_id(id);
        }
        self.layer_of.insert(id, layer);
        self.built.insert(def.as_ref().clone(), id);
        debug!(node = %def.short_name(), layer, "built node");
        id
    }

    fn layer(&self, node: NodeId) -> usize {
        self.layer_of.get(&node).copied().unwrap_or(0)
    }

    fn add_child(&mut self, parent: NodeId, child: NodeId, side: Side) -> Result<()> {
        self.nodes
            .get_mut(parent)?
            .add_child(ChildRef { node: child, side });
        Ok(())
    }

    /// Builds (or retrieves) the node for one stream definition.
    fn build_stream(&mut self, def: &Rc<StreamDef>) -> Result<NodeId> {
        if let Some(id) = self.built.get(def.as_ref()) {
            debug!(node = %def.short_name(), "sharing node");
            return Ok(*id);
        }
        match def.as_ref() {
            StreamDef::Source {
                fact_type,
                type_name,
                include_unassigned,
            } => {
                let assigned_fn = if *include_unassigned {
                    None
                } else {
                    self.registry.assigned_fn(*fact_type)
                };
                let node = SourceNode::new(*fact_type, *include_unassigned, assigned_fn);
                let id = self.insert_node(def, NodeData::Source(node), 0);
                let entry = self.sources.entry(*fact_type).or_default();
                if entry.len() >= 2 {
                    return Err(NetError::too_many_sources(*type_name));
                }
                entry.push(id);
                Ok(id)
            }
            StreamDef::Filter { parent, predicate } => {
                let parent_id = self.build_stream(parent)?;
                let verdict_slot = self.reserve_slots(&parent.tuple_source(), 1);
                let node = FilterNode {
                    children: Vec::new(),
                    predicate: self.registry.predicate(*predicate),
                    verdict_slot,
                    label: def.short_name(),
                };
                let layer = self.layer(parent_id) + 1;
                let id = self.insert_node(def, NodeData::Filter(node), layer);
                self.add_child(parent_id, id, Side::Single)?;
                Ok(id)
            }
            StreamDef::Map { parent, mapper } => {
                let parent_id = self.build_stream(parent)?;
                let out_slot = self.reserve_slots(&parent.tuple_source(), 1);
                let node = MapNode {
                    id: NodeId::default(),
                    children: Vec::new(),
                    mapper: self.registry.mapper(*mapper),
                    out_slot,
                    out_store_size: 0,
                    queue: Default::default(),
                    label: def.short_name(),
                };
                let layer = self.layer(parent_id) + 1;
                let id = self.insert_node(def, NodeData::Map(node), layer);
                self.add_child(parent_id, id, Side::Single)?;
                Ok(id)
            }
            StreamDef::FlatMap { parent, expander } => {
                let parent_id = self.build_stream(parent)?;
                let outs_slot = self.reserve_slots(&parent.tuple_source(), 1);
                let node = FlatMapNode {
                    id: NodeId::default(),
                    children: Vec::new(),
                    expander: self.registry.expander(*expander),
                    outs_slot,
                    out_store_size: 0,
                    queue: Default::default(),
                    label: def.short_name(),
                };
                let layer = self.layer(parent_id) + 1;
                let id = self.insert_node(def, NodeData::FlatMap(node), layer);
                self.add_child(parent_id, id, Side::Single)?;
                Ok(id)
            }
            StreamDef::Join {
                left,
                right,
                left_key,
                right_key,
                residual,
            } => {
                let left_id = self.build_stream(left)?;
                let right_id = self.build_stream(right)?;
                let lbase = self.reserve_slots(&left.tuple_source(), 3);
                let rbase = self.reserve_slots(&right.tuple_source(), 3);
                let node = JoinNode::new(
                    self.registry.key(*left_key),
                    self.registry.key(*right_key),
                    residual.map(|id| self.registry.predicate(id)),
                    JoinSlots {
                        key: lbase,
                        entry: lbase + 1,
                        outs: lbase + 2,
                    },
                    JoinSlots {
                        key: rbase,
                        entry: rbase + 1,
                        outs: rbase + 2,
                    },
                    def.short_name(),
                );
                let layer = self.layer(left_id).max(self.layer(right_id)) + 1;
                let id = self.insert_node(def, NodeData::Join(node), layer);
                self.add_child(left_id, id, Side::Left)?;
                self.add_child(right_id, id, Side::Right)?;
                Ok(id)
            }
            StreamDef::IfExists {
                left,
                right,
                should_exist,
                include_unassigned,
                left_key,
                right_key,
            } => {
                let left_id = self.build_stream(left)?;
                let right_id = self.build_stream(right)?;
                let lbase = self.reserve_slots(&left.tuple_source(), 3);
                let rbase = self.reserve_slots(&right.tuple_source(), 2);
                let node = IfExistsNode::new(
                    *should_exist,
                    *include_unassigned,
                    self.registry.key(*left_key),
                    self.registry.key(*right_key),
                    ExistsLeftSlots {
                        key: lbase,
                        entry: lbase + 1,
                        count: lbase + 2,
                    },
                    ExistsRightSlots {
                        key: rbase,
                        entry: rbase + 1,
                    },
                    def.short_name(),
                );
                let layer = self.layer(left_id).max(self.layer(right_id)) + 1;
                let id = self.insert_node(def, NodeData::IfExists(node), layer);
                self.add_child(left_id, id, Side::Left)?;
                self.add_child(right_id, id, Side::Right)?;
                Ok(id)
            }
            StreamDef::Group {
                parent,
                key_fn,
                collector,
            } => {
                if key_fn.is_none() && collector.is_none() {
                    return Err(NetError::build_error(
                        "group stage needs a key, a collector, or both",
                    ));
                }
                let parent_id = self.build_stream(parent)?;
                let base = self.reserve_slots(&parent.tuple_source(), 2);
                let node = GroupNode::new(
                    key_fn.map(|id| self.registry.group_key(id)),
                    collector.map(|id| self.registry.collector(id)),
                    GroupSlots {
                        key: base,
                        undo: base + 1,
                    },
                    def.short_name(),
                );
                let layer = self.layer(parent_id) + 1;
                let id = self.insert_node(def, NodeData::Group(node), layer);
                self.add_child(parent_id, id, Side::Single)?;
                Ok(id)
            }
        }
    }

    /// Writes the final scratch-store sizes into every tuple-creating node.
    fn finalize_store_sizes(&mut self) {
        let sizes: Vec<(NodeId, usize)> = self
            .built
            .iter()
            .map(|(def, id)| (*id, self.slot_counters.get(def).copied().unwrap_or(0)))
            .collect();
        for (id, size) in sizes {
            if let Ok(node) = self.nodes.get_mut(id) {
                match node {
                    NodeData::Source(n) => n.store_size = size,
                    NodeData::Map(n) => n.out_store_size = size,
                    NodeData::FlatMap(n) => n.out_store_size = size,
                    NodeData::Join(n) => n.out_store_size = size,
                    NodeData::Group(n) => n.out_store_size = size,
                    _ => {}
                }
            }
        }
    }

    pub fn build(mut self) -> Result<Session<S>> {
        let inliner = Rc::new(RefCell::new(ScoreInliner::new(self.match_tracking)));

        let constraints = std::mem::take(&mut self.constraints);
        for constraint in constraints {
            if constraint.weight.is_zero() {
                debug!(constraint = %constraint.name, "skipping zero-weight constraint");
                continue;
            }
            let stream_id = self.build_stream(&constraint.stream)?;
            let constraint_ref = inliner
                .borrow_mut()
                .register_constraint(&constraint.name, constraint.weight.clone());
            let scorer = ScorerNode::new(
                constraint_ref,
                S::build_impacter(&constraint.weight),
                self.registry.weight(constraint.match_weight),
                inliner.clone(),
            );
            let scorer_id = self.nodes.insert(NodeData::Scorer(scorer));
            self.add_child(stream_id, scorer_id, Side::Single)?;
            debug!(constraint = %constraint.name, "wired constraint scorer");
        }

        self.finalize_store_sizes();

        // layer table drives the drain order; only queue-owning nodes appear
        let mut layers: Vec<Vec<NodeId>> = Vec::new();
        for (id, node) in self.nodes.iter() {
            let has_queue = match node {
                NodeData::Source(_)
                | NodeData::Map(_)
                | NodeData::FlatMap(_)
                | NodeData::Join(_)
                | NodeData::Group(_) => true,
                NodeData::Filter(_) | NodeData::IfExists(_) | NodeData::Scorer(_) => false,
            };
            if has_queue {
                let layer = self.layer(id);
                if layers.len() <= layer {
                    layers.resize_with(layer + 1, Vec::new);
                }
                layers[layer].push(id);
            }
        }
        debug!(
            nodes = self.nodes.len(),
            layers = layers.len(),
            "network built"
        );

        Ok(Session::new(
            self.nodes,
            layers,
            self.sources,
            inliner,
            self.limits,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::SimpleScore;
    use crate::stream_def::FunctionId;
    use crate::tuple::Tuple;

    fn source_def() -> Rc<StreamDef> {
        Rc::new(StreamDef::Source {
            fact_type: TypeId::of::<i64>(),
            type_name: "i64",
            include_unassigned: true,
        })
    }

    fn simple_constraint(
        registry: &mut FunctionRegistry,
        name: &str,
        weight: SimpleScore,
        stream: Rc<StreamDef>,
    ) -> ConstraintDef<SimpleScore> {
        ConstraintDef {
            name: name.into(),
            weight,
            stream,
            match_weight: registry.register_weight(Rc::new(|_: &Tuple| 1)),
        }
    }

    #[test]
    fn shared_prefix_builds_one_filter_node() {
        let mut registry = FunctionRegistry::new();
        let predicate = registry.register_predicate(Rc::new(|_: &Tuple| true));
        let filtered = Rc::new(StreamDef::Filter {
            parent: source_def(),
            predicate,
        });
        let constraints = vec![
            simple_constraint(&mut registry, "a", SimpleScore::of(-1), filtered.clone()),
            simple_constraint(&mut registry, "b", SimpleScore::of(-2), filtered),
        ];
        let factory =
            NetworkFactory::new(registry, constraints, false, ResourceLimits::default());
        let session = factory.build().unwrap();
        // one source, one filter, two scorers
        assert_eq!(session.node_count(), 4);
    }

    #[test]
    fn zero_weight_constraints_are_left_out() {
        let mut registry = FunctionRegistry::new();
        let constraints = vec![
            simple_constraint(&mut registry, "live", SimpleScore::of(-1), source_def()),
            simple_constraint(&mut registry, "dead", SimpleScore::zero(), source_def()),
        ];
        let factory =
            NetworkFactory::new(registry, constraints, false, ResourceLimits::default());
        let session = factory.build().unwrap();
        // one source plus one scorer; the zero-weight constraint built nothing
        assert_eq!(session.node_count(), 2);
        assert_eq!(session.constraint_names(), vec!["live".to_string()]);
    }

    #[test]
    fn join_layers_sit_below_their_inputs() {
        let mut registry = FunctionRegistry::new();
        let key = registry.register_key(Rc::new(|t: &Tuple| {
            t.fact::<i64>(0).map(|v| *v as u64)
        }));
        let join = Rc::new(StreamDef::Join {
            left: source_def(),
            right: source_def(),
            left_key: key,
            right_key: key,
            residual: None,
        });
        let grouped = Rc::new(StreamDef::Group {
            parent: join,
            key_fn: None,
            collector: Some(registry.register_collector(crate::collectors::Collectors::count())),
        });
        let constraints = vec![simple_constraint(
            &mut registry,
            "joined",
            SimpleScore::of(-1),
            grouped,
        )];
        let factory =
            NetworkFactory::new(registry, constraints, false, ResourceLimits::default());
        let session = factory.build().unwrap();
        // source at 0, join at 1, group at 2
        assert_eq!(session.layer_count(), 3);
    }

    #[test]
    fn group_without_key_or_collector_is_rejected() {
        let mut registry = FunctionRegistry::new();
        let bad = Rc::new(StreamDef::Group {
            parent: source_def(),
            key_fn: None,
            collector: None,
        });
        let constraints = vec![simple_constraint(
            &mut registry,
            "bad",
            SimpleScore::of(-1),
            bad,
        )];
        let factory =
            NetworkFactory::new(registry, constraints, false, ResourceLimits::default());
        assert!(factory.build().is_err());
    }
}
