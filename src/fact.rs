// fact.rs - Fact trait and primitive implementations
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

/// Core trait for all facts flowing through the network.
///
/// The trait is object-safe so the engine can store `Rc<dyn Fact>` and the
/// caller can downcast at the edges. `fact_id` must be unique per inserted
/// fact; value-like facts (group keys, collector results) derive their id
/// from their value instead.
pub trait Fact: Debug + 'static {
    /// Unique identifier for the fact instance.
    fn fact_id(&self) -> i64;
    /// Boxed clone of the fact.
    fn clone_fact(&self) -> Box<dyn Fact>;
    /// Hash of the fact, defaulting to hashing the `fact_id`.
    fn hash_fact(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.fact_id().hash(&mut hasher);
        hasher.finish()
    }
    /// Equality, defaulting to comparing `fact_id`.
    fn eq_fact(&self, other: &dyn Fact) -> bool {
        self.fact_id() == other.fact_id()
    }
    /// The fact as `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Downcast a fact trait object to a concrete type.
pub fn downcast_fact<T: Fact>(fact: &dyn Fact) -> Option<&T> {
    fact.as_any().downcast_ref::<T>()
}

fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

// Value-like impls for the primitive types used as group keys and collector
// results. Their identity is their value.

macro_rules! int_fact {
    ($($ty:ty),*) => {$(
        impl Fact for $ty {
            fn fact_id(&self) -> i64 {
                *self as i64
            }
            fn clone_fact(&self) -> Box<dyn Fact> {
                Box::new(*self)
            }
            fn hash_fact(&self) -> u64 {
                hash_value(self)
            }
            fn eq_fact(&self, other: &dyn Fact) -> bool {
                downcast_fact::<$ty>(other).map_or(false, |o| o == self)
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    )*};
}

int_fact!(i64, i32, u64, u32, usize);

impl Fact for f64 {
    fn fact_id(&self) -> i64 {
        self.to_bits() as i64
    }
    fn clone_fact(&self) -> Box<dyn Fact> {
        Box::new(*self)
    }
    fn hash_fact(&self) -> u64 {
        self.to_bits()
    }
    fn eq_fact(&self, other: &dyn Fact) -> bool {
        downcast_fact::<f64>(other).map_or(false, |o| o.to_bits() == self.to_bits())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Fact for String {
    fn fact_id(&self) -> i64 {
        hash_value(self) as i64
    }
    fn clone_fact(&self) -> Box<dyn Fact> {
        Box::new(self.clone())
    }
    fn hash_fact(&self) -> u64 {
        hash_value(self)
    }
    fn eq_fact(&self, other: &dyn Fact) -> bool {
        downcast_fact::<String>(other).map_or(false, |o| o == self)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Fact for bool {
    fn fact_id(&self) -> i64 {
        *self as i64
    }
    fn clone_fact(&self) -> Box<dyn Fact> {
        Box::new(*self)
    }
    fn hash_fact(&self) -> u64 {
        hash_value(self)
    }
    fn eq_fact(&self, other: &dyn Fact) -> bool {
        downcast_fact::<bool>(other).map_or(false, |o| o == self)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}
