// collectors.rs - Aggregation containers for group nodes

use crate::fact::Fact;
use crate::tuple::Tuple;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::rc::Rc;

/// Receipt handed out by [`Collector::insert`]; passing it back to `remove`
/// undoes that insertion exactly. The meaning of the bits is private to each
/// collector (an insertion id for most, the inserted value for numeric ones,
/// so removal never re-reads facts that may have changed since).
pub type UndoReceipt = u64;

/// Aggregation container living inside one group of a group node.
pub trait Collector: Debug {
    /// Accumulates one member tuple and returns the undo receipt.
    fn insert(&mut self, tuple: &Tuple) -> UndoReceipt;

    /// Reverts a previous insertion via its receipt.
    fn remove(&mut self, receipt: UndoReceipt);

    /// Current aggregate as a fact for the group's output tuple.
    fn result_as_fact(&self) -> Rc<dyn Fact>;

    fn is_empty(&self) -> bool;
}

pub type NumberFn = Rc<dyn Fn(&Tuple) -> i64>;
pub type FactFn = Rc<dyn Fn(&Tuple) -> Rc<dyn Fact>>;

/// List of facts as a fact, for list/distinct collector results.
#[derive(Debug, Clone)]
pub struct FactList(pub Vec<Rc<dyn Fact>>);

impl Fact for FactList {
    fn fact_id(&self) -> i64 {
        let mut id = 0xcbf2_9ce4_8422_2325u64 as i64;
        for fact in &self.0 {
            id = id.wrapping_mul(31).wrapping_add(fact.hash_fact() as i64);
        }
        id
    }
    fn clone_fact(&self) -> Box<dyn Fact> {
        Box::new(self.clone())
    }
    fn eq_fact(&self, other: &dyn Fact) -> bool {
        match other.as_any().downcast_ref::<FactList>() {
            Some(o) => {
                self.0.len() == o.0.len()
                    && self.0.iter().zip(o.0.iter()).all(|(a, b)| a.eq_fact(b.as_ref()))
            }
            None => false,
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CountCollector {
    count: usize,
}

impl Collector for CountCollector {
    fn insert(&mut self, _tuple: &Tuple) -> UndoReceipt {
        self.count += 1;
        0
    }
    fn remove(&mut self, _receipt: UndoReceipt) {
        self.count -= 1;
    }
    fn result_as_fact(&self) -> Rc<dyn Fact> {
        Rc::new(self.count as i64)
    }
    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

pub struct SumCollector {
    mapper: NumberFn,
    sum: i64,
    count: usize,
}

impl Debug for SumCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SumCollector")
            .field("sum", &self.sum)
            .field("count", &self.count)
            .finish()
    }
}

impl Collector for SumCollector {
    fn insert(&mut self, tuple: &Tuple) -> UndoReceipt {
        let value = (self.mapper)(tuple);
        self.sum += value;
        self.count += 1;
        value as u64
    }
    fn remove(&mut self, receipt: UndoReceipt) {
        self.sum -= receipt as i64;
        self.count -= 1;
    }
    fn result_as_fact(&self) -> Rc<dyn Fact> {
        Rc::new(self.sum)
    }
    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

pub struct AvgCollector {
    mapper: NumberFn,
    sum: i64,
    count: usize,
}

impl Debug for AvgCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvgCollector")
            .field("sum", &self.sum)
            .field("count", &self.count)
            .finish()
    }
}

impl Collector for AvgCollector {
    fn insert(&mut self, tuple: &Tuple) -> UndoReceipt {
        let value = (self.mapper)(tuple);
        self.sum += value;
        self.count += 1;
        value as u64
    }
    fn remove(&mut self, receipt: UndoReceipt) {
        self.sum -= receipt as i64;
        self.count -= 1;
    }
    fn result_as_fact(&self) -> Rc<dyn Fact> {
        if self.count == 0 {
            Rc::new(0.0f64)
        } else {
            Rc::new(self.sum as f64 / self.count as f64)
        }
    }
    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Shared core of min/max: a multiset of values ordered by key.
pub struct ExtremeCollector {
    mapper: NumberFn,
    values: BTreeMap<i64, usize>,
    count: usize,
    take_max: bool,
}

impl Debug for ExtremeCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtremeCollector")
            .field("count", &self.count)
            .field("take_max", &self.take_max)
            .finish()
    }
}

impl Collector for ExtremeCollector {
    fn insert(&mut self, tuple: &Tuple) -> UndoReceipt {
        let value = (self.mapper)(tuple);
        *self.values.entry(value).or_insert(0) += 1;
        self.count += 1;
        value as u64
    }
    fn remove(&mut self, receipt: UndoReceipt) {
        let value = receipt as i64;
        if let Some(n) = self.values.get_mut(&value) {
            *n -= 1;
            if *n == 0 {
                self.values.remove(&value);
            }
        }
        self.count -= 1;
    }
    fn result_as_fact(&self) -> Rc<dyn Fact> {
        let extreme = if self.take_max {
            self.values.keys().next_back()
        } else {
            self.values.keys().next()
        };
        Rc::new(extreme.copied().unwrap_or(0))
    }
    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

pub struct ListCollector {
    mapper: FactFn,
    items: BTreeMap<u64, Rc<dyn Fact>>,
    next_receipt: u64,
}

impl Debug for ListCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListCollector")
            .field("len", &self.items.len())
            .finish()
    }
}

impl Collector for ListCollector {
    fn insert(&mut self, tuple: &Tuple) -> UndoReceipt {
        let receipt = self.next_receipt;
        self.next_receipt += 1;
        self.items.insert(receipt, (self.mapper)(tuple));
        receipt
    }
    fn remove(&mut self, receipt: UndoReceipt) {
        self.items.remove(&receipt);
    }
    fn result_as_fact(&self) -> Rc<dyn Fact> {
        // receipts are monotonic, so values come out in insertion order
        Rc::new(FactList(self.items.values().cloned().collect()))
    }
    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Distinct values with reference counts; the result lists each value once.
pub struct DistinctCollector {
    mapper: FactFn,
    values: BTreeMap<u64, (Rc<dyn Fact>, usize)>,
    count: usize,
}

impl Debug for DistinctCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistinctCollector")
            .field("distinct", &self.values.len())
            .field("count", &self.count)
            .finish()
    }
}

impl Collector for DistinctCollector {
    fn insert(&mut self, tuple: &Tuple) -> UndoReceipt {
        let fact = (self.mapper)(tuple);
        let key = fact.hash_fact();
        let entry = self.values.entry(key).or_insert((fact, 0));
        entry.1 += 1;
        self.count += 1;
        key
    }
    fn remove(&mut self, receipt: UndoReceipt) {
        if let Some(entry) = self.values.get_mut(&receipt) {
            entry.1 -= 1;
            if entry.1 == 0 {
                self.values.remove(&receipt);
            }
        }
        self.count -= 1;
    }
    fn result_as_fact(&self) -> Rc<dyn Fact> {
        Rc::new(FactList(self.values.values().map(|(f, _)| f.clone()).collect()))
    }
    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Factory for collector suppliers, one supplier per group.
pub struct Collectors;

pub type CollectorFactory = Rc<dyn Fn() -> Box<dyn Collector>>;

impl Collectors {
    pub fn count() -> CollectorFactory {
        Rc::new(|| Box::new(CountCollector::default()))
    }

    pub fn sum(mapper: NumberFn) -> CollectorFactory {
        Rc::new(move || {
            Box::new(SumCollector {
                mapper: mapper.clone(),
                sum: 0,
                count: 0,
            })
        })
    }

    pub fn avg(mapper: NumberFn) -> CollectorFactory {
        Rc::new(move || {
            Box::new(AvgCollector {
                mapper: mapper.clone(),
                sum: 0,
                count: 0,
            })
        })
    }

    pub fn min(mapper: NumberFn) -> CollectorFactory {
        Rc::new(move || {
            Box::new(ExtremeCollector {
                mapper: mapper.clone(),
                values: BTreeMap::new(),
                count: 0,
                take_max: false,
            })
        })
    }

    pub fn max(mapper: NumberFn) -> CollectorFactory {
        Rc::new(move || {
            Box::new(ExtremeCollector {
                mapper: mapper.clone(),
                values: BTreeMap::new(),
                count: 0,
                take_max: true,
            })
        })
    }

    pub fn to_list(mapper: FactFn) -> CollectorFactory {
        Rc::new(move || {
            Box::new(ListCollector {
                mapper: mapper.clone(),
                items: BTreeMap::new(),
                next_receipt: 0,
            })
        })
    }

    pub fn distinct(mapper: FactFn) -> CollectorFactory {
        Rc::new(move || {
            Box::new(DistinctCollector {
                mapper: mapper.clone(),
                values: BTreeMap::new(),
                count: 0,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::FactVec;
    use smallvec::smallvec;

    fn tuple_of(value: i64) -> Tuple {
        let facts: FactVec = smallvec![Rc::new(value) as Rc<dyn Fact>];
        Tuple::new(facts, None, 0)
    }

    fn value_fn() -> NumberFn {
        Rc::new(|t: &Tuple| *t.fact::<i64>(0).unwrap())
    }

    fn result_i64(c: &dyn Collector) -> i64 {
        *crate::fact::downcast_fact::<i64>(c.result_as_fact().as_ref()).unwrap()
    }

    #[test]
    fn count_tracks_inserts_and_removes() {
        let mut c = CountCollector::default();
        let r1 = c.insert(&tuple_of(1));
        let _r2 = c.insert(&tuple_of(2));
        assert_eq!(result_i64(&c), 2);
        c.remove(r1);
        assert_eq!(result_i64(&c), 1);
        assert!(!c.is_empty());
    }

    #[test]
    fn sum_undo_via_receipt_survives_fact_mutation() {
        let make = Collectors::sum(value_fn());
        let mut c = make();
        let receipt = c.insert(&tuple_of(10));
        c.insert(&tuple_of(-4));
        assert_eq!(result_i64(c.as_ref()), 6);
        // the receipt carries the inserted value, no fact lookup on removal
        c.remove(receipt);
        assert_eq!(result_i64(c.as_ref()), -4);
    }

    #[test]
    fn min_max_over_multiset() {
        let make_min = Collectors::min(value_fn());
        let make_max = Collectors::max(value_fn());
        let mut min = make_min();
        let mut max = make_max();
        let mut receipts = Vec::new();
        for v in [5, -2, 9, -2] {
            receipts.push(min.insert(&tuple_of(v)));
            max.insert(&tuple_of(v));
        }
        assert_eq!(result_i64(min.as_ref()), -2);
        assert_eq!(result_i64(max.as_ref()), 9);
        // removing one of two -2s keeps the min
        min.remove(receipts[1]);
        assert_eq!(result_i64(min.as_ref()), -2);
        min.remove(receipts[3]);
        assert_eq!(result_i64(min.as_ref()), 5);
    }

    #[test]
    fn list_keeps_insertion_order() {
        let make = Collectors::to_list(Rc::new(|t: &Tuple| t.fact_rc(0).unwrap().clone()));
        let mut c = make();
        c.insert(&tuple_of(3));
        let r = c.insert(&tuple_of(1));
        c.insert(&tuple_of(2));
        c.remove(r);
        let list = c.result_as_fact();
        let list = crate::fact::downcast_fact::<FactList>(list.as_ref()).unwrap();
        let values: Vec<i64> = list
            .0
            .iter()
            .map(|f| *crate::fact::downcast_fact::<i64>(f.as_ref()).unwrap())
            .collect();
        assert_eq!(values, vec![3, 2]);
    }

    #[test]
    fn distinct_counts_references() {
        let make = Collectors::distinct(Rc::new(|t: &Tuple| t.fact_rc(0).unwrap().clone()));
        let mut c = make();
        let r1 = c.insert(&tuple_of(7));
        let _r2 = c.insert(&tuple_of(7));
        let list = c.result_as_fact();
        assert_eq!(
            crate::fact::downcast_fact::<FactList>(list.as_ref()).unwrap().0.len(),
            1
        );
        c.remove(r1);
        assert!(!c.is_empty());
        let list = c.result_as_fact();
        assert_eq!(
            crate::fact::downcast_fact::<FactList>(list.as_ref()).unwrap().0.len(),
            1
        );
    }
}
