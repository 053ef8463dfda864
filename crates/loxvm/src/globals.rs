//! The VM's global-variable table.
//!
//! Two parallel structures, kept deliberately separate rather than collapsed
//! into a `name -> cell` map: an append-only value array indexed by a
//! compile-time-assigned slot, and a name -> slot hash table. A reverse map
//! recovers a name from a slot for stack-trace and error messages.

use crate::heap::{Heap, ObjectId};
use crate::table::Table;
use crate::value::Value;

#[derive(Debug, Default)]
pub struct Globals {
    values: Vec<Value>,
    names: Table,
    /// `reverse[i]` is the interned name string for slot `i`. Debug-only —
    /// read by error reporting, never by the dispatch loop.
    reverse: Vec<ObjectId>,
}

impl Globals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the slot for `name`, reserving a new one (initialized to
    /// `empty`) if this is the first time it's been referenced.
    pub fn resolve_or_reserve(&mut self, heap: &mut Heap, name: &str) -> usize {
        let name_id = heap.intern_string(name);
        let key = Value::Obj(name_id);
        let hash = key.hash(heap);
        if let Some(Value::Number(idx)) = self.names.get(key, hash) {
            return idx as usize;
        }
        let idx = self.values.len();
        self.values.push(Value::Empty);
        self.reverse.push(name_id);
        self.names.put(key, hash, Value::Number(idx as f64));
        idx
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Value {
        self.values[idx]
    }

    pub fn set(&mut self, idx: usize, value: Value) {
        self.values[idx] = value;
    }

    #[must_use]
    pub fn is_defined(&self, idx: usize) -> bool {
        !matches!(self.values[idx], Value::Empty)
    }

    #[must_use]
    pub fn name_at(&self, idx: usize) -> ObjectId {
        self.reverse[idx]
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.values.len()
    }

    /// Roots for the garbage collector: every global's current value, plus
    /// every name string (kept alive even for slots still `empty`).
    pub fn for_each_root(&self, mut visit_value: impl FnMut(Value), mut visit_object: impl FnMut(ObjectId)) {
        for &v in &self.values {
            visit_value(v);
        }
        for &id in &self.reverse {
            visit_object(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserving_same_name_twice_returns_same_slot() {
        let mut heap = Heap::new();
        let mut g = Globals::new();
        let a = g.resolve_or_reserve(&mut heap, "x");
        let b = g.resolve_or_reserve(&mut heap, "x");
        assert_eq!(a, b);
    }

    #[test]
    fn reserved_slot_starts_empty() {
        let mut heap = Heap::new();
        let mut g = Globals::new();
        let idx = g.resolve_or_reserve(&mut heap, "x");
        assert!(!g.is_defined(idx));
        g.set(idx, Value::Number(1.0));
        assert!(g.is_defined(idx));
    }
}
