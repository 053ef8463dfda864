//! The stack-based virtual machine: dispatch loop, call frames, and runtime
//! error reporting.
//!
//! The instruction pointer lives on each [`CallFrame`] rather than as a
//! free-standing local, since Rust has nowhere to stash a raw pointer into
//! the active chunk the way the reference VM does — `ip` is re-read from
//! (and written back to) the top frame around every call and return instead.

use crate::chunk::OpCode;
use crate::compiler;
use crate::error::{InterpretError, RuntimeError, StackFrame};
use crate::gc;
use crate::globals::Globals;
use crate::heap::{Heap, ObjectId};
use crate::io::PrintWriter;
use crate::object::{
    NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjData, ObjInstance, ObjNative, ObjUpvalue, UpvalueState,
};
use crate::value::Value;

/// Maximum simultaneously active call frames (spec's "maximum call frames").
const MAX_FRAMES: usize = 64;
/// Initial value-stack reservation. Not a hard cap — recursion depth is
/// bounded by `MAX_FRAMES`, not by stack length.
const STACK_MAX: usize = 256;

struct CallFrame {
    closure: ObjectId,
    ip: usize,
    /// Absolute stack index at which this frame's locals (slot 0 = receiver
    /// or reserved `this`/script slot) begin.
    slots_offset: usize,
}

/// One Lox virtual machine. Each instance starts from a clean heap and
/// global table — no state persists across instances. A REPL that wants
/// variables to persist across lines keeps one `Vm` for the whole session
/// rather than building a new one per line.
pub struct Vm<'p> {
    heap: Heap,
    globals: Globals,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues, sorted by descending stack index — mirrors the
    /// reference VM's invariant that the list's addresses strictly
    /// decrease, even though ours is index-addressed rather than pointer-chased.
    open_upvalues: Vec<ObjectId>,
    /// Interned once at startup; compared against during class
    /// instantiation to find a constructor method.
    init_string: ObjectId,
    print: &'p mut dyn PrintWriter,
}

impl<'p> Vm<'p> {
    #[must_use]
    pub fn new(print: &'p mut dyn PrintWriter) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern_string("init");
        let mut vm = Self {
            heap,
            globals: Globals::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(MAX_FRAMES),
            open_upvalues: Vec::new(),
            init_string,
            print,
        };
        vm.define_native("clock", 0, native_clock);
        vm
    }

    /// Compiles and runs one complete program. A failed compile runs no
    /// bytecode at all.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function_id =
            compiler::compile(source, &mut self.heap, &mut self.globals).map_err(InterpretError::Compile)?;
        let closure_id = self.heap.allocate(ObjData::Closure(ObjClosure { function: function_id, upvalues: Vec::new() }));
        self.push(Value::Obj(closure_id));
        let slots_offset = self.stack.len() - 1;
        self.frames.push(CallFrame { closure: closure_id, ip: 0, slots_offset });
        self.run().map_err(InterpretError::Runtime)
    }

    fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let native_id = self.heap.allocate(ObjData::Native(ObjNative { name, arity, function }));
        let idx = self.globals.resolve_or_reserve(&mut self.heap, name);
        self.globals.set(idx, Value::Obj(native_id));
    }

    // --- stack / frame plumbing -------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow — compiler emitted unbalanced bytecode")
    }

    fn peek(&self, back: usize) -> Value {
        self.stack[self.stack.len() - 1 - back]
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("vm always has an active frame while running")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("vm always has an active frame while running")
    }

    fn current_chunk(&self) -> &crate::chunk::Chunk {
        let ObjData::Closure(c) = self.heap.get(self.current_frame().closure) else {
            unreachable!("a call frame always wraps a closure")
        };
        let ObjData::Function(f) = self.heap.get(c.function) else {
            unreachable!("a closure always wraps a function")
        };
        &f.chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.current_frame().ip;
        let byte = self.current_chunk().read_byte(ip);
        self.current_frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.current_frame().ip;
        let value = self.current_chunk().read_u16(ip);
        self.current_frame_mut().ip += 2;
        value
    }

    fn chunk_constant(&self, idx: usize) -> Value {
        self.current_chunk().constant(idx)
    }

    fn value_as_string(&self, value: Value) -> String {
        let Value::Obj(id) = value else { unreachable!("name operands are always interned strings") };
        let ObjData::String(s) = self.heap.get(id) else { unreachable!("name operands are always strings") };
        s.bytes.clone()
    }

    /// Builds a [`RuntimeError`] with the stack trace captured at the point
    /// of failure (innermost frame first), then resets the VM to a clean
    /// slate by clearing the stack, frames and open upvalues.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let ObjData::Closure(c) = self.heap.get(frame.closure) else { unreachable!() };
            let ObjData::Function(f) = self.heap.get(c.function) else { unreachable!() };
            let line = f.chunk.line_at(frame.ip.saturating_sub(1));
            let name = match f.name {
                Some(id) => self.value_as_string(Value::Obj(id)),
                None => "script".to_owned(),
            };
            frames.push(StackFrame { line, name });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError { message: message.into(), frames }
    }

    // --- dispatch loop -------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op = OpCode::from_byte(self.read_byte());
            match op {
                OpCode::Constant => {
                    let idx = self.read_byte() as usize;
                    self.push(self.chunk_constant(idx));
                }
                OpCode::ConstantLong => {
                    let idx = self.read_u16() as usize;
                    self.push(self.chunk_constant(idx));
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopN => {
                    let n = self.read_u16() as usize;
                    self.stack.truncate(self.stack.len() - n);
                }
                OpCode::Dup => self.push(self.peek(0)),
                OpCode::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.values_equal(b)));
                }
                OpCode::Neq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(!a.values_equal(b)));
                }
                OpCode::Greater => self.binary_cmp(|a, b| a > b)?,
                OpCode::GreaterEq => self.binary_cmp(|a, b| a >= b)?,
                OpCode::Less => self.binary_cmp(|a, b| a < b)?,
                OpCode::LessEq => self.binary_cmp(|a, b| a <= b)?,
                OpCode::Negate => self.negate()?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Add => self.add()?,
                OpCode::Sub => self.binary_arith(|a, b| a - b)?,
                OpCode::Mul => self.binary_arith(|a, b| a * b)?,
                OpCode::Div => self.division()?,
                OpCode::Mod => self.binary_arith(|a, b| a % b)?,
                OpCode::Print => {
                    let v = self.pop();
                    let text = v.to_display_string(&self.heap);
                    self.print.print(&text);
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_byte() as usize;
                    let v = self.pop();
                    self.globals.set(idx, v);
                }
                OpCode::DefineGlobalLong => {
                    let idx = self.read_u16() as usize;
                    let v = self.pop();
                    self.globals.set(idx, v);
                }
                OpCode::GetGlobal => self.get_global(false)?,
                OpCode::GetGlobalLong => self.get_global(true)?,
                OpCode::SetGlobal => self.set_global(false)?,
                OpCode::SetGlobalLong => self.set_global(true)?,
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let abs = self.current_frame().slots_offset + slot;
                    self.push(self.stack[abs]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let abs = self.current_frame().slots_offset + slot;
                    self.stack[abs] = self.peek(0);
                }
                OpCode::GetUpvalue => self.get_upvalue(),
                OpCode::SetUpvalue => self.set_upvalue(),
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Jmp => {
                    let off = self.read_u16() as usize;
                    self.current_frame_mut().ip += off;
                }
                OpCode::JmpBack => {
                    let off = self.read_u16() as usize;
                    self.current_frame_mut().ip -= off;
                }
                OpCode::JmpTrue => {
                    let off = self.read_u16() as usize;
                    if !self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += off;
                    }
                }
                OpCode::JmpFalse => {
                    let off = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += off;
                    }
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(argc)?;
                }
                OpCode::Closure => self.make_closure(),
                OpCode::Class => self.class_op(),
                OpCode::Method => self.method_op(),
                OpCode::Invoke => self.invoke()?,
                OpCode::Inherit => self.inherit()?,
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::GetSuper => self.get_super()?,
                OpCode::SuperInvoke => self.super_invoke()?,
                OpCode::Return => {
                    if self.return_op() {
                        return Ok(());
                    }
                }
            }

            if self.heap.bytes_allocated > self.heap.next_gc {
                self.collect_garbage();
            }
        }
    }

    // --- arithmetic / comparison -------------------------------------------------

    fn binary_cmp(&mut self, cmp: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let (Value::Number(x), Value::Number(y)) = (a, b) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.push(Value::Bool(cmp(x, y)));
        Ok(())
    }

    fn binary_arith(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let (Value::Number(x), Value::Number(y)) = (a, b) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.push(Value::Number(op(x, y)));
        Ok(())
    }

    fn division(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let (Value::Number(x), Value::Number(y)) = (a, b) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        if y == 0.0 {
            return Err(self.runtime_error("Division by zero."));
        }
        self.push(Value::Number(x / y));
        Ok(())
    }

    fn negate(&mut self) -> Result<(), RuntimeError> {
        let Value::Number(n) = self.peek(0) else {
            return Err(self.runtime_error("Operand must be a number."));
        };
        self.pop();
        self.push(Value::Number(-n));
        Ok(())
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
            _ if a.is_string(&self.heap) && b.is_string(&self.heap) => {
                let mut combined = self.value_as_string(a);
                combined.push_str(&self.value_as_string(b));
                let id = self.heap.intern_string(&combined);
                self.push(Value::Obj(id));
            }
            _ => return Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
        Ok(())
    }

    // --- globals -------------------------------------------------

    fn get_global(&mut self, long: bool) -> Result<(), RuntimeError> {
        let idx = if long { self.read_u16() as usize } else { self.read_byte() as usize };
        if !self.globals.is_defined(idx) {
            let name = self.value_as_string(Value::Obj(self.globals.name_at(idx)));
            return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
        }
        self.push(self.globals.get(idx));
        Ok(())
    }

    fn set_global(&mut self, long: bool) -> Result<(), RuntimeError> {
        let idx = if long { self.read_u16() as usize } else { self.read_byte() as usize };
        if !self.globals.is_defined(idx) {
            let name = self.value_as_string(Value::Obj(self.globals.name_at(idx)));
            return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
        }
        self.globals.set(idx, self.peek(0));
        Ok(())
    }

    // --- upvalues -------------------------------------------------

    fn get_upvalue(&mut self) {
        let slot = self.read_byte() as usize;
        let ObjData::Closure(c) = self.heap.get(self.current_frame().closure) else { unreachable!() };
        let up_id = c.upvalues[slot];
        let ObjData::Upvalue(u) = self.heap.get(up_id) else { unreachable!() };
        let value = match u.state {
            UpvalueState::Open(stack_idx) => self.stack[stack_idx],
            UpvalueState::Closed(v) => v,
        };
        self.push(value);
    }

    fn set_upvalue(&mut self) {
        let slot = self.read_byte() as usize;
        let ObjData::Closure(c) = self.heap.get(self.current_frame().closure) else { unreachable!() };
        let up_id = c.upvalues[slot];
        let value = self.peek(0);
        let ObjData::Upvalue(u) = self.heap.get(up_id) else { unreachable!() };
        match u.state {
            UpvalueState::Open(stack_idx) => self.stack[stack_idx] = value,
            UpvalueState::Closed(_) => {
                let ObjData::Upvalue(u) = self.heap.get_mut(up_id) else { unreachable!() };
                u.state = UpvalueState::Closed(value);
            }
        }
    }

    /// Finds (or creates) the open upvalue for `stack_index`, keeping
    /// `open_upvalues` sorted by descending stack index.
    fn capture_upvalue(&mut self, stack_index: usize) -> ObjectId {
        for &id in &self.open_upvalues {
            let ObjData::Upvalue(u) = self.heap.get(id) else { unreachable!() };
            match u.state {
                UpvalueState::Open(idx) if idx == stack_index => return id,
                UpvalueState::Open(idx) if idx < stack_index => break,
                _ => {}
            }
        }
        let id = self.heap.allocate(ObjData::Upvalue(ObjUpvalue { state: UpvalueState::Open(stack_index) }));
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|&existing| {
                let ObjData::Upvalue(u) = self.heap.get(existing) else { unreachable!() };
                matches!(u.state, UpvalueState::Open(idx) if idx < stack_index)
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, id);
        id
    }

    /// Closes (lifts to owned storage) every open upvalue at or above
    /// `from_stack_index`.
    fn close_upvalues(&mut self, from_stack_index: usize) {
        while let Some(&id) = self.open_upvalues.first() {
            let ObjData::Upvalue(u) = self.heap.get(id) else { unreachable!() };
            let UpvalueState::Open(idx) = u.state else {
                unreachable!("closed upvalue found in the open list")
            };
            if idx < from_stack_index {
                break;
            }
            let value = self.stack[idx];
            let ObjData::Upvalue(u) = self.heap.get_mut(id) else { unreachable!() };
            u.state = UpvalueState::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn make_closure(&mut self) {
        let fn_idx = self.read_u16() as usize;
        let Value::Obj(function_id) = self.chunk_constant(fn_idx) else {
            unreachable!("CLOSURE operand always names a function constant")
        };
        let ObjData::Function(f) = self.heap.get(function_id) else { unreachable!() };
        let upvalue_count = f.upvalue_count;

        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_u16() as usize;
            if is_local {
                let abs = self.current_frame().slots_offset + index;
                upvalues.push(self.capture_upvalue(abs));
            } else {
                let ObjData::Closure(c) = self.heap.get(self.current_frame().closure) else { unreachable!() };
                upvalues.push(c.upvalues[index]);
            }
        }

        let closure_id = self.heap.allocate(ObjData::Closure(ObjClosure { function: function_id, upvalues }));
        self.push(Value::Obj(closure_id));
    }

    // --- classes -------------------------------------------------

    fn class_op(&mut self) {
        let name_idx = self.read_byte() as usize;
        let Value::Obj(name_id) = self.chunk_constant(name_idx) else { unreachable!() };
        let class_id = self.heap.allocate(ObjData::Class(ObjClass::new(name_id)));
        self.push(Value::Obj(class_id));
    }

    fn method_op(&mut self) {
        let name_idx = self.read_byte() as usize;
        let name = self.chunk_constant(name_idx);
        let hash = name.hash(&self.heap);
        let method = self.pop();
        let Value::Obj(class_id) = self.peek(0) else { unreachable!("compiler always pushes the class here") };
        let ObjData::Class(class) = self.heap.get_mut(class_id) else { unreachable!() };
        class.methods.put(name, hash, method);
    }

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let Value::Obj(superclass_id) = self.peek(1) else {
            return Err(self.runtime_error("Superclass must be a class."));
        };
        let ObjData::Class(superclass) = self.heap.get(superclass_id) else {
            return Err(self.runtime_error("Superclass must be a class."));
        };
        let methods = superclass.methods.clone();
        let Value::Obj(subclass_id) = self.peek(0) else { unreachable!("compiler always pushes the class here") };
        let ObjData::Class(subclass) = self.heap.get_mut(subclass_id) else { unreachable!() };
        methods.copy_into(&mut subclass.methods);
        self.pop(); // the subclass; re-pushed by the compiler right after INHERIT
        Ok(())
    }

    fn bind_method(&mut self, class_id: ObjectId, name: Value, hash: u32, receiver: Value) -> Result<(), RuntimeError> {
        let ObjData::Class(class) = self.heap.get(class_id) else { unreachable!() };
        let Some(method_value) = class.methods.get(name, hash) else {
            let name_str = self.value_as_string(name);
            return Err(self.runtime_error(format!("Undefined property '{name_str}'.")));
        };
        let Value::Obj(method_id) = method_value else { unreachable!("method table values are always closures") };
        let bound_id = self.heap.allocate(ObjData::BoundMethod(ObjBoundMethod { receiver, method: method_id }));
        self.push(Value::Obj(bound_id));
        Ok(())
    }

    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let name_idx = self.read_byte() as usize;
        let name = self.chunk_constant(name_idx);
        let Value::Obj(instance_id) = self.peek(0) else {
            return Err(self.runtime_error("Only instances have properties."));
        };
        let ObjData::Instance(instance) = self.heap.get(instance_id) else {
            return Err(self.runtime_error("Only instances have properties."));
        };
        let hash = name.hash(&self.heap);
        if let Some(value) = instance.fields.get(name, hash) {
            self.pop();
            self.push(value);
            return Ok(());
        }
        let class_id = instance.class;
        let receiver = self.pop();
        self.bind_method(class_id, name, hash, receiver)
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let name_idx = self.read_byte() as usize;
        let name = self.chunk_constant(name_idx);
        let Value::Obj(instance_id) = self.peek(1) else {
            return Err(self.runtime_error("Only instances have fields."));
        };
        let hash = name.hash(&self.heap);
        let value = self.peek(0);
        let ObjData::Instance(instance) = self.heap.get_mut(instance_id) else {
            return Err(self.runtime_error("Only instances have fields."));
        };
        instance.fields.put(name, hash, value);
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn get_super(&mut self) -> Result<(), RuntimeError> {
        let name_idx = self.read_byte() as usize;
        let name = self.chunk_constant(name_idx);
        let hash = name.hash(&self.heap);
        let Value::Obj(superclass_id) = self.pop() else { unreachable!("compiler always pushes the superclass here") };
        let receiver = self.pop();
        self.bind_method(superclass_id, name, hash, receiver)
    }

    fn invoke_from_class(&mut self, class_id: ObjectId, name: Value, hash: u32, argc: usize) -> Result<(), RuntimeError> {
        let ObjData::Class(class) = self.heap.get(class_id) else { unreachable!() };
        let Some(method_value) = class.methods.get(name, hash) else {
            let name_str = self.value_as_string(name);
            return Err(self.runtime_error(format!("Undefined property '{name_str}'.")));
        };
        let Value::Obj(closure_id) = method_value else { unreachable!("method table values are always closures") };
        self.call_closure(closure_id, argc)
    }

    fn invoke(&mut self) -> Result<(), RuntimeError> {
        let name_idx = self.read_byte() as usize;
        let argc = self.read_byte() as usize;
        let name = self.chunk_constant(name_idx);
        let receiver_slot = self.stack.len() - 1 - argc;
        let Value::Obj(instance_id) = self.stack[receiver_slot] else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let ObjData::Instance(instance) = self.heap.get(instance_id) else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let hash = name.hash(&self.heap);
        if let Some(value) = instance.fields.get(name, hash) {
            self.stack[receiver_slot] = value;
            return self.call_value(argc);
        }
        let class_id = instance.class;
        self.invoke_from_class(class_id, name, hash, argc)
    }

    fn super_invoke(&mut self) -> Result<(), RuntimeError> {
        let name_idx = self.read_byte() as usize;
        let argc = self.read_byte() as usize;
        let name = self.chunk_constant(name_idx);
        let hash = name.hash(&self.heap);
        let Value::Obj(superclass_id) = self.pop() else { unreachable!("compiler always pushes the superclass here") };
        self.invoke_from_class(superclass_id, name, hash, argc)
    }

    // --- calls -------------------------------------------------

    fn call_value(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee = self.peek(argc);
        let Value::Obj(id) = callee else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match self.heap.get(id) {
            ObjData::Closure(_) => self.call_closure(id, argc),
            ObjData::Native(_) => self.call_native(id, argc),
            ObjData::Class(_) => self.call_class(id, argc),
            ObjData::BoundMethod(_) => self.call_bound_method(id, argc),
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure_id: ObjectId, argc: usize) -> Result<(), RuntimeError> {
        let ObjData::Closure(c) = self.heap.get(closure_id) else { unreachable!() };
        let ObjData::Function(f) = self.heap.get(c.function) else { unreachable!() };
        let arity = f.arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_offset = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure: closure_id, ip: 0, slots_offset });
        Ok(())
    }

    fn call_native(&mut self, native_id: ObjectId, argc: usize) -> Result<(), RuntimeError> {
        let ObjData::Native(n) = self.heap.get(native_id) else { unreachable!() };
        let arity = n.arity as usize;
        let function = n.function;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        let start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[start..].to_vec();
        let result = function(&args).map_err(|msg| self.runtime_error(msg))?;
        self.stack.truncate(start - 1);
        self.push(result);
        Ok(())
    }

    fn call_class(&mut self, class_id: ObjectId, argc: usize) -> Result<(), RuntimeError> {
        let instance_id = self.heap.allocate(ObjData::Instance(ObjInstance::new(class_id)));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(instance_id);

        let ObjData::Class(class) = self.heap.get(class_id) else { unreachable!() };
        let init_key = Value::Obj(self.init_string);
        let init_hash = init_key.hash(&self.heap);
        if let Some(init_value) = class.methods.get(init_key, init_hash) {
            let Value::Obj(init_closure) = init_value else { unreachable!() };
            return self.call_closure(init_closure, argc);
        }
        if argc != 0 {
            return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
        }
        Ok(())
    }

    fn call_bound_method(&mut self, bound_id: ObjectId, argc: usize) -> Result<(), RuntimeError> {
        let ObjData::BoundMethod(bm) = self.heap.get(bound_id) else { unreachable!() };
        let receiver = bm.receiver;
        let method = bm.method;
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = receiver;
        self.call_closure(method, argc)
    }

    /// Pops the current frame, closing any upvalues into it and copying the
    /// return value down to where the callee had sat. Returns `true` once
    /// the outermost (script) frame has returned.
    fn return_op(&mut self) -> bool {
        let result = self.pop();
        let frame = self.frames.pop().expect("return with no active frame");
        self.close_upvalues(frame.slots_offset);
        self.stack.truncate(frame.slots_offset);
        if self.frames.is_empty() {
            // Top-level script frame: drop the result along with its closure
            // slot so the stack is back to exactly where it was before this
            // `interpret()` call — a REPL keeping one `Vm` alive across lines
            // must not accumulate residue from earlier successful lines.
            true
        } else {
            self.push(result);
            false
        }
    }

    // --- garbage collection -------------------------------------------------

    fn collect_garbage(&mut self) {
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = &self.open_upvalues;
        let globals = &self.globals;
        let init_string = self.init_string;
        gc::collect(&mut self.heap, |heap, gray| {
            for &v in stack {
                gc::mark_value(heap, gray, v);
            }
            for frame in frames {
                gc::mark_object(heap, gray, frame.closure);
            }
            for &id in open_upvalues {
                gc::mark_object(heap, gray, id);
            }
            gc::mark_globals(heap, gray, globals);
            gc::mark_object(heap, gray, init_string);
        });
    }
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seconds = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0.0, |d| d.as_secs_f64());
    Ok(Value::Number(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CollectStringPrint;

    fn run(source: &str) -> String {
        let mut out = CollectStringPrint::new();
        let mut vm = Vm::new(&mut out);
        vm.interpret(source).unwrap_or_else(|e| panic!("unexpected interpret error: {e}"));
        out.joined()
    }

    fn run_err(source: &str) -> InterpretError {
        let mut out = CollectStringPrint::new();
        let mut vm = Vm::new(&mut out);
        vm.interpret(source).expect_err("expected interpret to fail")
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("print 1 + 2 * 3;"), "7");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(run(r#"var a = "hi"; var b = " there"; print a + b;"#), "hi there");
    }

    #[test]
    fn closures_capture_by_reference_to_the_enclosing_call() {
        assert_eq!(
            run("fun make(x){ fun inner(){ return x; } return inner; } print make(42)();"),
            "42"
        );
    }

    #[test]
    fn single_inheritance_dispatches_to_the_parent_method() {
        assert_eq!(run(r#"class A { say(){ print "A"; } } class B < A {} B().say();"#), "A");
    }

    #[test]
    fn for_loop_accumulates() {
        assert_eq!(run("var sum = 0; for (var i = 1; i <= 5; i = i + 1) sum = sum + i; print sum;"), "15");
    }

    #[test]
    fn const_reassignment_fails_to_compile_with_exit_65() {
        let err = run_err("const PI = 3.14; PI = 3;");
        assert_eq!(err.exit_code(), 65);
    }

    #[test]
    fn dividing_by_zero_is_a_runtime_error_with_exit_70() {
        let err = run_err("print 1 / 0;");
        assert_eq!(err.exit_code(), 70);
    }

    #[test]
    fn modulo_by_zero_is_nan_not_an_error() {
        assert_eq!(run("print 1 % 0 != 1 % 0;"), "true");
    }

    #[test]
    fn undefined_global_read_is_a_runtime_error() {
        let err = run_err("print doesNotExist;");
        assert_eq!(err.exit_code(), 70);
    }

    #[test]
    fn deep_recursion_within_the_limit_succeeds() {
        assert_eq!(
            run("fun count(n) { if (n <= 0) return 0; return 1 + count(n - 1); } print count(60);"),
            "60"
        );
    }

    #[test]
    fn stack_overflow_past_the_frame_limit_is_a_runtime_error() {
        let err = run_err("fun count(n) { return 1 + count(n - 1); } print count(1000);");
        assert_eq!(err.exit_code(), 70);
    }

    #[test]
    fn per_iteration_closures_each_capture_their_own_loop_value() {
        assert_eq!(
            run(
                "var fns = nil; var last = nil; \
                 for (var i = 0; i < 3; i = i + 1) { fun f() { return i; } last = f; } \
                 print last();"
            ),
            "2"
        );
    }

    #[test]
    fn switch_with_default_before_a_later_case_still_only_runs_once() {
        assert_eq!(run("switch (2) { default: print 0; case 1: print 1; case 2: print 2; }"), "2");
    }

    #[test]
    fn break_exits_a_while_loop_early() {
        assert_eq!(
            run("var i = 0; while (true) { if (i == 3) break; print i; i = i + 1; }"),
            "0\n1\n2"
        );
    }

    #[test]
    fn classes_run_init_implicitly_on_construction() {
        assert_eq!(
            run(r#"class Box { init(v) { this.v = v; } get() { return this.v; } } print Box(7).get();"#),
            "7"
        );
    }
}
