// lib.rs - Main library file
//!
//! Incremental constraint evaluation over a dataflow network.
//!
//! Constraints are declared as streams (filter, join, group, existence
//! checks, reshaping) that end in a penalty or reward. The built session
//! keeps a node network between the declarations and the score: fact
//! inserts, updates and retracts are propagated as deltas, so recomputing
//! the score after a small change costs work proportional to the change,
//! not to the problem size.

pub mod arena;
pub mod builder;
pub mod collectors;
pub mod element_list;
pub mod error;
pub mod fact;
pub mod factory;
pub mod index;
pub mod inliner;
pub mod limits;
pub mod nodes;
pub mod score;
pub mod session;
pub mod state;
pub mod stream_def;
pub mod tuple;

pub use builder::{ConstraintBuilder, Stream};
pub use collectors::{Collector, CollectorFactory, Collectors, FactList};
pub use error::{NetError, Result};
pub use fact::{downcast_fact, Fact};
pub use inliner::{ConstraintMatch, ConstraintMatchTotal, ConstraintRef};
pub use limits::ResourceLimits;
pub use score::{
    HardMediumSoftScore, HardSoftScore, Score, ScoreImpacter, SimpleDecimalScore, SimpleScore,
};
pub use session::Session;
pub use state::TupleState;
pub use tuple::{FactVec, Tuple};

/// Convenience function to create a new constraint builder with default limits.
pub fn builder<S: Score>() -> ConstraintBuilder<S> {
    ConstraintBuilder::new()
}

/// Convenience function to create a constraint builder with custom resource limits.
pub fn builder_with_limits<S: Score>(limits: ResourceLimits) -> ConstraintBuilder<S> {
    ConstraintBuilder::new().with_limits(limits)
}

/// A "prelude" module for easily importing the most commonly used types.
pub mod prelude {
    pub use crate::{
        builder, builder_with_limits, Collectors, ConstraintBuilder, Fact, HardMediumSoftScore,
        HardSoftScore, NetError, ResourceLimits, Score, Session, SimpleDecimalScore, SimpleScore,
        Stream, Tuple,
    };
}
