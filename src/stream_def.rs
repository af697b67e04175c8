// stream_def.rs - Structural stream descriptors and the function registry

use crate::collectors::CollectorFactory;
use crate::nodes::{AssignedFn, ExpandFn, GroupKeyFn, KeyFn, MapperFn, MatchWeightFn, Predicate};
use crate::score::Score;
use rustc_hash::FxHashMap;
use std::any::TypeId;
use std::fmt;
use std::rc::Rc;

/// Handle to a registered user function. Two stream definitions that carry
/// the same handles are structurally identical, so definition equality is
/// what drives node sharing: a cloned or re-used stream value keeps its
/// handles and lands on the already-built node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u64);

/// Shape of one derived stream, up to function identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamDef {
    Source {
        fact_type: TypeId,
        type_name: &'static str,
        include_unassigned: bool,
    },
    Filter {
        parent: Rc<StreamDef>,
        predicate: FunctionId,
    },
    Map {
        parent: Rc<StreamDef>,
        mapper: FunctionId,
    },
    FlatMap {
        parent: Rc<StreamDef>,
        expander: FunctionId,
    },
    Join {
        left: Rc<StreamDef>,
        right: Rc<StreamDef>,
        left_key: FunctionId,
        right_key: FunctionId,
        residual: Option<FunctionId>,
    },
    IfExists {
        left: Rc<StreamDef>,
        right: Rc<StreamDef>,
        should_exist: bool,
        include_unassigned: bool,
        left_key: FunctionId,
        right_key: FunctionId,
    },
    Group {
        parent: Rc<StreamDef>,
        key_fn: Option<FunctionId>,
        collector: Option<FunctionId>,
    },
}

impl StreamDef {
    /// The nearest stream whose node creates the tuples flowing here.
    /// Pass-through stages never create tuples, so their consumers reserve
    /// scratch slots on this stream's tuples instead.
    pub fn tuple_source(self: &Rc<Self>) -> Rc<StreamDef> {
        match self.as_ref() {
            StreamDef::Filter { parent, .. } => parent.tuple_source(),
            StreamDef::IfExists { left, .. } => left.tuple_source(),
            _ => self.clone(),
        }
    }

    pub fn short_name(&self) -> String {
        match self {
            StreamDef::Source { type_name, include_unassigned, .. } => {
                if *include_unassigned {
                    format!("source[{type_name}+unassigned]")
                } else {
                    format!("source[{type_name}]")
                }
            }
            StreamDef::Filter { predicate, .. } => format!("filter#{}", predicate.0),
            StreamDef::Map { mapper, .. } => format!("map#{}", mapper.0),
            StreamDef::FlatMap { expander, .. } => format!("flat_map#{}", expander.0),
            StreamDef::Join { left_key, right_key, .. } => {
                format!("join#{}x{}", left_key.0, right_key.0)
            }
            StreamDef::IfExists { should_exist, left_key, .. } => {
                if *should_exist {
                    format!("if_exists#{}", left_key.0)
                } else {
                    format!("if_not_exists#{}", left_key.0)
                }
            }
            StreamDef::Group { key_fn, collector, .. } => format!(
                "group#{}/{}",
                key_fn.map_or(0, |f| f.0),
                collector.map_or(0, |f| f.0)
            ),
        }
    }
}

/// A constraint as declared by the builder: a terminal stream, a weight and
/// the per-match weight function.
#[derive(Debug, Clone)]
pub struct ConstraintDef<S: Score> {
    pub name: String,
    pub weight: S,
    pub stream: Rc<StreamDef>,
    pub match_weight: FunctionId,
}

/// Owns every user closure behind a [`FunctionId`]. Handles index into the
/// table of their kind, so ids from different tables may collide; the
/// [`StreamDef`] variant always fixes which table a handle belongs to.
#[derive(Default)]
pub struct FunctionRegistry {
    predicates: Vec<Predicate>,
    mappers: Vec<MapperFn>,
    expanders: Vec<ExpandFn>,
    keys: Vec<KeyFn>,
    group_keys: Vec<GroupKeyFn>,
    collectors: Vec<CollectorFactory>,
    weights: Vec<MatchWeightFn>,
    assigned: FxHashMap<TypeId, AssignedFn>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("predicates", &self.predicates.len())
            .field("mappers", &self.mappers.len())
            .field("expanders", &self.expanders.len())
            .field("keys", &self.keys.len())
            .field("group_keys", &self.group_keys.len())
            .field("collectors", &self.collectors.len())
            .field("weights", &self.weights.len())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_predicate(&mut self, f: Predicate) -> FunctionId {
        self.predicates.push(f);
        FunctionId(self.predicates.len() as u64 - 1)
    }

    pub fn register_mapper(&mut self, f: MapperFn) -> FunctionId {
        self.mappers.push(f);
        FunctionId(self.mappers.len() as u64 - 1)
    }

    pub fn register_expander(&mut self, f: ExpandFn) -> FunctionId {
        self.expanders.push(f);
        FunctionId(self.expanders.len() as u64 - 1)
    }

    pub fn register_key(&mut self, f: KeyFn) -> FunctionId {
        self.keys.push(f);
        FunctionId(self.keys.len() as u64 - 1)
    }

    pub fn register_group_key(&mut self, f: GroupKeyFn) -> FunctionId {
        self.group_keys.push(f);
        FunctionId(self.group_keys.len() as u64 - 1)
    }

    pub fn register_collector(&mut self, f: CollectorFactory) -> FunctionId {
        self.collectors.push(f);
        FunctionId(self.collectors.len() as u64 - 1)
    }

    pub fn register_weight(&mut self, f: MatchWeightFn) -> FunctionId {
        self.weights.push(f);
        FunctionId(self.weights.len() as u64 - 1)
    }

    /// Declares the assignedness test of a fact type; sources excluding
    /// unassigned facts consult it.
    pub fn register_assigned(&mut self, fact_type: TypeId, f: AssignedFn) {
        self.assigned.insert(fact_type, f);
    }

    pub fn predicate(&self, id: FunctionId) -> Predicate {
        self.predicates[id.0 as usize].clone()
    }

    pub fn mapper(&self, id: FunctionId) -> MapperFn {
        self.mappers[id.0 as usize].clone()
    }

    pub fn expander(&self, id: FunctionId) -> ExpandFn {
        self.expanders[id.0 as usize].clone()
    }

    pub fn key(&self, id: FunctionId) -> KeyFn {
        self.keys[id.0 as usize].clone()
    }

    pub fn group_key(&self, id: FunctionId) -> GroupKeyFn {
        self.group_keys[id.0 as usize].clone()
    }

    pub fn collector(&self, id: FunctionId) -> CollectorFactory {
        self.collectors[id.0 as usize].clone()
    }

    pub fn weight(&self, id: FunctionId) -> MatchWeightFn {
        self.weights[id.0 as usize].clone()
    }

    pub fn assigned_fn(&self, fact_type: TypeId) -> Option<AssignedFn> {
        self.assigned.get(&fact_type).cloned()
    }
}
