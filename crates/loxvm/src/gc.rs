//! Tri-color mark-sweep garbage collection.
//!
//! This module holds no state of its own — [`Heap`] already owns the arena,
//! the mark bits, and the byte-accounting counters that decide *when* to
//! collect. `gc` is just the mark/trace/sweep algorithm that runs over it.
//! The caller (the VM) supplies every root through the `mark_roots` closure
//! passed to [`collect`]: the value stack, each call frame's closure, the
//! globals table, and every open upvalue.

use crate::globals::Globals;
use crate::heap::{next_gc_after_collection, Heap, ObjectId};
use crate::object::{ObjData, UpvalueState};
use crate::value::Value;

/// Marks `value` reachable, pushing its object onto the gray worklist the
/// first time it's seen this cycle. Non-object values are no-ops.
pub fn mark_value(heap: &mut Heap, gray: &mut Vec<ObjectId>, value: Value) {
    if let Value::Obj(id) = value {
        mark_object(heap, gray, id);
    }
}

/// Marks `id` reachable, pushing it onto the gray worklist iff this is the
/// first time it's been marked this cycle.
pub fn mark_object(heap: &mut Heap, gray: &mut Vec<ObjectId>, id: ObjectId) {
    if heap.mark(id) {
        gray.push(id);
    }
}

/// Marks every global's current value and every global's name string, even
/// for slots declared but not yet assigned.
pub fn mark_globals(heap: &mut Heap, gray: &mut Vec<ObjectId>, globals: &Globals) {
    let mut values = Vec::new();
    let mut names = Vec::new();
    globals.for_each_root(|v| values.push(v), |id| names.push(id));
    for v in values {
        mark_value(heap, gray, v);
    }
    for id in names {
        mark_object(heap, gray, id);
    }
}

/// Drains the gray worklist, marking every object each entry references,
/// until nothing new is discovered.
pub fn trace_references(heap: &mut Heap, gray: &mut Vec<ObjectId>) {
    while let Some(id) = gray.pop() {
        blacken(heap, gray, id);
    }
}

/// The direct children of one heap object, extracted before marking so
/// `blacken` doesn't need to hold a borrow of `heap` while it recurses into
/// `mark_object`/`mark_value` (which need `&mut heap` themselves).
enum Children {
    None,
    Function { name: Option<ObjectId>, constants: Vec<Value> },
    Closure { function: ObjectId, upvalues: Vec<ObjectId> },
    ClosedUpvalue(Value),
    Class { name: ObjectId, entries: Vec<(Value, Value)> },
    Instance { class: ObjectId, entries: Vec<(Value, Value)> },
    BoundMethod { receiver: Value, method: ObjectId },
}

fn blacken(heap: &mut Heap, gray: &mut Vec<ObjectId>, id: ObjectId) {
    let children = match heap.get(id) {
        ObjData::String(_) | ObjData::Native(_) => Children::None,
        ObjData::Function(f) => Children::Function { name: f.name, constants: f.chunk.constants().to_vec() },
        ObjData::Closure(c) => Children::Closure { function: c.function, upvalues: c.upvalues.clone() },
        ObjData::Upvalue(u) => match u.state {
            UpvalueState::Closed(v) => Children::ClosedUpvalue(v),
            UpvalueState::Open(_) => Children::None,
        },
        ObjData::Class(class) => Children::Class { name: class.name, entries: class.methods.iter().collect() },
        ObjData::Instance(inst) => {
            Children::Instance { class: inst.class, entries: inst.fields.iter().collect() }
        }
        ObjData::BoundMethod(bm) => Children::BoundMethod { receiver: bm.receiver, method: bm.method },
    };

    match children {
        Children::None => {}
        Children::Function { name, constants } => {
            if let Some(name_id) = name {
                mark_object(heap, gray, name_id);
            }
            for c in constants {
                mark_value(heap, gray, c);
            }
        }
        Children::Closure { function, upvalues } => {
            mark_object(heap, gray, function);
            for up in upvalues {
                mark_object(heap, gray, up);
            }
        }
        Children::ClosedUpvalue(v) => mark_value(heap, gray, v),
        Children::Class { name, entries } => {
            mark_object(heap, gray, name);
            for (k, v) in entries {
                mark_value(heap, gray, k);
                mark_value(heap, gray, v);
            }
        }
        Children::Instance { class, entries } => {
            mark_object(heap, gray, class);
            for (k, v) in entries {
                mark_value(heap, gray, k);
                mark_value(heap, gray, v);
            }
        }
        Children::BoundMethod { receiver, method } => {
            mark_value(heap, gray, receiver);
            mark_object(heap, gray, method);
        }
    }
}

/// Runs one full collection cycle: reset every mark bit, mark roots (via
/// `mark_roots`), trace the whole reachable graph, then sweep. Recomputes
/// `heap.next_gc` from the post-sweep byte count. Returns the number of
/// bytes freed.
pub fn collect(heap: &mut Heap, mark_roots: impl FnOnce(&mut Heap, &mut Vec<ObjectId>)) -> usize {
    let before = heap.bytes_allocated;
    heap.unmark_all();
    let mut gray = Vec::new();
    mark_roots(heap, &mut gray);
    trace_references(heap, &mut gray);
    heap.sweep();
    heap.next_gc = next_gc_after_collection(heap.bytes_allocated);
    before.saturating_sub(heap.bytes_allocated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjClosure, ObjFunction};

    #[test]
    fn unreferenced_object_is_collected() {
        let mut heap = Heap::new();
        let orphan = heap.allocate(ObjData::Function(ObjFunction::new(None)));
        collect(&mut heap, |_heap, _gray| {});
        assert!(!heap.live_ids().any(|id| id == orphan));
    }

    #[test]
    fn rooted_object_and_its_children_survive() {
        let mut heap = Heap::new();
        let function = heap.allocate(ObjData::Function(ObjFunction::new(None)));
        let closure = heap.allocate(ObjData::Closure(ObjClosure { function, upvalues: Vec::new() }));

        collect(&mut heap, |heap, gray| mark_object(heap, gray, closure));

        assert!(heap.live_ids().any(|id| id == closure));
        assert!(heap.live_ids().any(|id| id == function));
    }

    #[test]
    fn globals_root_their_values() {
        let mut heap = Heap::new();
        let mut globals = Globals::new();
        let idx = globals.resolve_or_reserve(&mut heap, "x");
        let s = heap.intern_string("kept alive");
        globals.set(idx, Value::Obj(s));

        collect(&mut heap, |heap, gray| mark_globals(heap, gray, &globals));

        assert!(heap.live_ids().any(|id| id == s));
    }
}
