//! Heap object payloads.
//!
//! [`ObjData`] is a closed sum type over every heap-allocated kind this
//! interpreter has: string, function, native, closure, upvalue, class,
//! instance, bound method. The reference VM gives each of these its own
//! struct sharing a header; here dispatch is a `match` over one enum instead,
//! and the header (mark bit, arena slot) lives on [`crate::heap::HeapSlot`]
//! rather than embedded in each payload.

use std::fmt;

use crate::chunk::Chunk;
use crate::heap::{Heap, ObjectId};
use crate::table::Table;
use crate::value::Value;

/// An interned, owned byte string.
///
/// Every string here owns its bytes; the reference implementation's
/// `is_constant` flag (for strings borrowed straight from the source
/// buffer) is not reproduced; a source-buffer lifetime would have to thread
/// through `Heap` and every `Value` for an allocation saved only on startup.
#[derive(Debug, Clone)]
pub struct ObjString {
    pub bytes: String,
    pub hash: u32,
}

#[derive(Debug, Clone)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjectId>,
}

impl ObjFunction {
    #[must_use]
    pub fn new(name: Option<ObjectId>) -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

#[derive(Clone, Copy)]
pub struct ObjNative {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

impl fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjNative").field("name", &self.name).field("arity", &self.arity).finish()
    }
}

#[derive(Debug, Clone)]
pub struct ObjClosure {
    pub function: ObjectId,
    pub upvalues: Vec<ObjectId>,
}

/// Where an upvalue gets its value from: still a live stack slot, or
/// lifted into its own storage once that slot's frame has returned.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
}

#[derive(Debug, Clone)]
pub struct ObjClass {
    pub name: ObjectId,
    pub methods: Table,
}

impl ObjClass {
    #[must_use]
    pub fn new(name: ObjectId) -> Self {
        Self { name, methods: Table::new() }
    }
}

#[derive(Debug, Clone)]
pub struct ObjInstance {
    pub class: ObjectId,
    pub fields: Table,
}

impl ObjInstance {
    #[must_use]
    pub fn new(class: ObjectId) -> Self {
        Self { class, fields: Table::new() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjectId,
}

/// The payload of one heap object. See the module docs for how this
/// replaces the reference implementation's header-plus-subclass layout.
#[derive(Debug, Clone)]
pub enum ObjData {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl ObjData {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Function(_) => "function",
            Self::Native(_) => "native function",
            Self::Closure(_) => "closure",
            Self::Upvalue(_) => "upvalue",
            Self::Class(_) => "class",
            Self::Instance(_) => "instance",
            Self::BoundMethod(_) => "bound method",
        }
    }

    fn format_function(heap: &Heap, f: &mut impl fmt::Write, function: &ObjFunction) -> fmt::Result {
        match function.name {
            Some(name_id) => match heap.get(name_id) {
                ObjData::String(s) => write!(f, "<fn {}>", s.bytes),
                _ => unreachable!("function name is always a string"),
            },
            None => write!(f, "<script>"),
        }
    }

    pub fn format(&self, heap: &Heap, f: &mut impl fmt::Write) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s.bytes),
            Self::Function(func) => Self::format_function(heap, f, func),
            Self::Native(n) => write!(f, "<native fn {}>", n.name),
            Self::Closure(c) => match heap.get(c.function) {
                ObjData::Function(func) => Self::format_function(heap, f, func),
                _ => unreachable!("closure always wraps a function"),
            },
            Self::Upvalue(_) => unreachable!("upvalues are never observed by user code"),
            Self::Class(class) => match heap.get(class.name) {
                ObjData::String(s) => write!(f, "{}", s.bytes),
                _ => unreachable!("class name is always a string"),
            },
            Self::Instance(inst) => match heap.get(inst.class) {
                ObjData::Class(class) => match heap.get(class.name) {
                    ObjData::String(s) => write!(f, "{} instance", s.bytes),
                    _ => unreachable!("class name is always a string"),
                },
                _ => unreachable!("instance always points at a class"),
            },
            Self::BoundMethod(bm) => match heap.get(bm.method) {
                ObjData::Closure(c) => match heap.get(c.function) {
                    ObjData::Function(func) => Self::format_function(heap, f, func),
                    _ => unreachable!("closure always wraps a function"),
                },
                _ => unreachable!("bound method always wraps a closure"),
            },
        }
    }
}
