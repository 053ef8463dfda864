//! Single-pass Pratt compiler: source text straight to bytecode, no
//! intermediate AST.
//!
//! The compiler is a stack of [`FrameState`]s, one per nested
//! function/method currently being compiled, threaded through `frames`
//! (index `0` is always the implicit top-level script). Expression parsing
//! dispatches prefix/infix rules by a `match` on token kind rather than a
//! static rule table of function pointers — the usual shape for this in
//! Rust, since a table of bound methods doesn't fit the borrow checker as
//! cleanly as it does a C vtable.

use ahash::AHashSet;

use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::globals::Globals;
use crate::heap::{Heap, ObjectId};
use crate::object::{ObjData, ObjFunction};
use crate::scanner::{Scanner, Token, TokenType};
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: usize = 255;
const MAX_ARGS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

fn precedence_of(kind: TokenType) -> Precedence {
    use TokenType::{
        And, BangEqual, Dot, EqualEqual, Greater, GreaterEqual, LeftParen, Less, LessEqual, Minus,
        Or, Percent, Plus, Slash, Star,
    };
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash | Percent => Precedence::Factor,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    /// `-1` means "declared but initializer not yet evaluated".
    depth: i32,
    is_constant: bool,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

#[derive(Debug)]
struct FrameState {
    function: ObjFunction,
    function_type: FunctionType,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    /// Global slot indices declared `const`. Only ever populated on the
    /// outermost (script) frame — functions always open their own scope
    /// immediately on entry, so no nested frame ever compiles at global
    /// scope. Kept per-frame for symmetry, read only from `frames[0]`.
    global_constants: AHashSet<usize>,
}

impl FrameState {
    fn new(function_type: FunctionType, name: Option<ObjectId>) -> Self {
        let reserved_name = match function_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            FunctionType::Function | FunctionType::Script => "",
        };
        Self {
            function: ObjFunction::new(name),
            function_type,
            locals: vec![Local {
                name: reserved_name.to_owned(),
                depth: 0,
                is_constant: false,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            global_constants: AHashSet::new(),
        }
    }
}

/// Pending unwind targets for `break`/`continue`, one per active loop or
/// switch. `continue_target` is `None` for a switch (continue must skip
/// past it to the nearest enclosing loop).
struct Breakable {
    continue_target: Option<usize>,
    break_jumps: Vec<usize>,
    /// Local count at entry, so break/continue know how many locals to
    /// unwind before jumping out.
    locals_depth: usize,
}

struct ClassCompiler {
    has_superclass: bool,
}

struct Compiler<'src, 'h, 'g> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'h mut Heap,
    globals: &'g mut Globals,
    frames: Vec<FrameState>,
    breakables: Vec<Breakable>,
    class_stack: Vec<ClassCompiler>,
}

/// Compiles `source` into a top-level script function. On any compile
/// error, no partial function is returned — a failed compile yields no
/// program at all.
pub fn compile(source: &str, heap: &mut Heap, globals: &mut Globals) -> Result<ObjectId, Vec<CompileError>> {
    let mut scanner = Scanner::new(source);
    let placeholder = scanner.scan_token();
    let mut compiler = Compiler {
        scanner,
        previous: placeholder,
        current: placeholder,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        heap,
        globals,
        frames: vec![FrameState::new(FunctionType::Script, None)],
        breakables: Vec::new(),
        class_stack: Vec::new(),
    };

    // Re-scan from the start: the placeholder token above was only to give
    // `current`/`previous` an initial value before the first real `advance`.
    compiler.scanner = Scanner::new(source);
    compiler.advance();
    while !compiler.check(TokenType::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenType::Eof, "Expect end of expression.");
    let (function_id, _upvalues) = compiler.end_compiler();

    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(function_id)
    }
}

impl<'src, 'h, 'g> Compiler<'src, 'h, 'g> {
    // --- token stream plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenType::Error {
                break;
            }
            let message = self.current.lexeme.to_owned();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenType) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenType) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenType, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let lexeme = (token.kind != TokenType::Eof).then(|| token.lexeme.to_owned());
        self.errors.push(CompileError {
            line: token.line,
            column: token.column,
            lexeme,
            message: message.to_owned(),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenType::Eof {
            if self.previous.kind == TokenType::Semicolon {
                return;
            }
            match self.current.kind {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::Const
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return
                | TokenType::Switch => return,
                _ => self.advance(),
            }
        }
    }

    // --- frame / chunk accessors -------------------------------------------------

    fn current_frame(&self) -> &FrameState {
        self.frames.last().expect("compiler always has an active frame")
    }

    fn current_frame_mut(&mut self) -> &mut FrameState {
        self.frames.last_mut().expect("compiler always has an active frame")
    }

    fn current_chunk(&self) -> &Chunk {
        &self.current_frame().function.chunk
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_frame_mut().function.chunk
    }

    // --- bytecode emission -------------------------------------------------

    fn emit_byte(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk_mut().write_byte(op as u8, line);
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk_mut().write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.current_chunk_mut().write_u16(value, line);
    }

    /// Emits a single-byte constant-pool operand for a name reference
    /// (class/method name, property access, `super` lookup). These opcodes
    /// only have a single-byte operand slot, unlike `OP_CONSTANT`'s
    /// long-form counterpart — so an index past `u8::MAX` can't just be
    /// truncated, it has to fail to compile.
    fn emit_name_byte(&mut self, idx: usize) {
        if idx > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return;
        }
        self.emit_u8(idx as u8);
    }

    fn emit_popn(&mut self, n: usize) {
        match n {
            0 => {}
            1 => self.emit_byte(OpCode::Pop),
            _ => {
                self.emit_byte(OpCode::PopN);
                self.emit_u16(n as u16);
            }
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.current_chunk_mut().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(message) = self.current_chunk_mut().patch_jump(offset) {
            self.error(&message);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if let Err(message) = self.current_chunk_mut().emit_loop(loop_start, line) {
            self.error(&message);
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = match self.current_chunk_mut().add_constant(value) {
            Ok(idx) => idx,
            Err(message) => {
                self.error(&message);
                return;
            }
        };
        if Chunk::needs_long_form(idx) {
            self.emit_byte(OpCode::ConstantLong);
            self.emit_u16(idx as u16);
        } else {
            self.emit_byte(OpCode::Constant);
            self.emit_u8(idx as u8);
        }
    }

    fn emit_global_op(&mut self, short: OpCode, long: OpCode, idx: usize) {
        if Chunk::needs_long_form(idx) {
            self.emit_byte(long);
            self.emit_u16(idx as u16);
        } else {
            self.emit_byte(short);
            self.emit_u8(idx as u8);
        }
    }

    /// Emits cleanup bytecode (POP/POPN and CLOSE_UPVALUE as needed) for
    /// every local declared since `target_local_count`, without touching the
    /// compiler's own bookkeeping (the scope is still lexically open; only
    /// the runtime stack needs unwinding because control is jumping out of
    /// it via `break`/`continue`).
    fn emit_unwind_to(&mut self, target_local_count: usize) {
        let flags: Vec<bool> =
            self.current_frame().locals[target_local_count..].iter().map(|l| l.is_captured).collect();
        let mut pending = 0usize;
        for captured in flags {
            if captured {
                if pending > 0 {
                    self.emit_popn(pending);
                    pending = 0;
                }
                self.emit_byte(OpCode::CloseUpvalue);
            } else {
                pending += 1;
            }
        }
        if pending > 0 {
            self.emit_popn(pending);
        }
    }

    fn emit_return(&mut self) {
        if self.current_frame().function_type == FunctionType::Initializer {
            self.emit_byte(OpCode::GetLocal);
            self.emit_u8(0);
        } else {
            self.emit_byte(OpCode::Nil);
        }
        self.emit_byte(OpCode::Return);
    }

    /// Finishes the current frame: emits the implicit `nil; return;`,
    /// allocates the finished function on the heap, and pops the frame.
    fn end_compiler(&mut self) -> (ObjectId, Vec<UpvalueDesc>) {
        self.emit_return();
        let frame = self.frames.pop().expect("ending a frame that was never pushed");
        let upvalues = frame.upvalues;
        let id = self.heap.allocate(ObjData::Function(frame.function));
        (id, upvalues)
    }

    // --- identifiers, globals, locals, upvalues -------------------------------------------------

    fn identifier_constant(&mut self, name: &str) -> usize {
        let id = self.heap.intern_string(name);
        match self.current_chunk_mut().add_constant(Value::Obj(id)) {
            Ok(idx) => idx,
            Err(message) => {
                self.error(&message);
                0
            }
        }
    }

    fn resolve_global(&mut self, name: &str) -> usize {
        self.globals.resolve_or_reserve(self.heap, name)
    }

    fn add_local(&mut self, name: &str, is_constant: bool) {
        if self.current_frame().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_frame_mut().locals.push(Local {
            name: name.to_owned(),
            depth: -1,
            is_constant,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self, name: &str, is_constant: bool) {
        if self.current_frame().scope_depth == 0 {
            return;
        }
        let depth = self.current_frame().scope_depth;
        for local in self.current_frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name, is_constant);
    }

    fn mark_initialized(&mut self) {
        if self.current_frame().scope_depth == 0 {
            return;
        }
        let depth = self.current_frame().scope_depth;
        self.current_frame_mut().locals.last_mut().expect("a local was just declared").depth = depth;
    }

    /// `global_idx` is ignored for locals (their "definition" is just
    /// marking the already-declared local initialized).
    fn define_variable(&mut self, global_idx: usize, is_const: bool) {
        if self.current_frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if is_const && !self.frames[0].global_constants.insert(global_idx) {
            self.error("Cannot re-declare const variable.");
        }
        self.emit_global_op(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global_idx);
    }

    fn parse_variable(&mut self, message: &str, is_const: bool) -> usize {
        self.consume(TokenType::Identifier, message);
        let name = self.previous.lexeme.to_owned();
        self.declare_variable(&name, is_const);
        if self.current_frame().scope_depth > 0 {
            return 0;
        }
        self.resolve_global(&name)
    }

    fn resolve_local(&self, frame_idx: usize, name: &str) -> Result<Option<usize>, &'static str> {
        let frame = &self.frames[frame_idx];
        for (i, local) in frame.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> usize {
        let frame = &mut self.frames[frame_idx];
        if let Some(i) = frame.upvalues.iter().position(|u| u.index == index && u.is_local == is_local) {
            return i;
        }
        if frame.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        frame.upvalues.push(UpvalueDesc { index, is_local });
        frame.function.upvalue_count = frame.upvalues.len();
        frame.upvalues.len() - 1
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Result<Option<usize>, &'static str> {
        if frame_idx == 0 {
            return Ok(None);
        }
        let enclosing = frame_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name)? {
            self.frames[enclosing].locals[local_idx].is_captured = true;
            return Ok(Some(self.add_upvalue(frame_idx, local_idx as u8, true)));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing, name)? {
            return Ok(Some(self.add_upvalue(frame_idx, up_idx as u8, false)));
        }
        Ok(None)
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let frame_idx = self.frames.len() - 1;

        match self.resolve_local(frame_idx, name) {
            Ok(Some(slot)) => {
                let is_const = self.current_frame().locals[slot].is_constant;
                if can_assign && self.matches(TokenType::Equal) {
                    if is_const {
                        self.error("Cannot re-assign const variable.");
                    }
                    self.expression();
                    self.emit_byte(OpCode::SetLocal);
                } else {
                    self.emit_byte(OpCode::GetLocal);
                }
                self.emit_u8(slot as u8);
                return;
            }
            Ok(None) => {}
            Err(message) => {
                self.error(message);
                return;
            }
        }

        match self.resolve_upvalue(frame_idx, name) {
            Ok(Some(slot)) => {
                if can_assign && self.matches(TokenType::Equal) {
                    self.expression();
                    self.emit_byte(OpCode::SetUpvalue);
                } else {
                    self.emit_byte(OpCode::GetUpvalue);
                }
                self.emit_u8(slot as u8);
                return;
            }
            Ok(None) => {}
            Err(message) => {
                self.error(message);
                return;
            }
        }

        let idx = self.resolve_global(name);
        if can_assign && self.matches(TokenType::Equal) {
            if self.frames[0].global_constants.contains(&idx) {
                self.error("Cannot re-assign const variable.");
            }
            self.expression();
            self.emit_global_op(OpCode::SetGlobal, OpCode::SetGlobalLong, idx);
        } else {
            self.emit_global_op(OpCode::GetGlobal, OpCode::GetGlobalLong, idx);
        }
    }

    // --- scopes -------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth_after = self.current_frame().scope_depth - 1;
        let mut flags = Vec::new();
        while let Some(local) = self.current_frame().locals.last() {
            if local.depth > depth_after {
                flags.push(local.is_captured);
                self.current_frame_mut().locals.pop();
            } else {
                break;
            }
        }
        self.current_frame_mut().scope_depth = depth_after;

        let mut pending = 0usize;
        for captured in flags {
            if captured {
                if pending > 0 {
                    self.emit_popn(pending);
                    pending = 0;
                }
                self.emit_byte(OpCode::CloseUpvalue);
            } else {
                pending += 1;
            }
        }
        if pending > 0 {
            self.emit_popn(pending);
        }
    }

    // --- declarations -------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenType::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenType::Const) {
            self.var_declaration(true);
        } else if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenType::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, is_const: bool) {
        let global_idx = self.parse_variable("Expect variable name.", is_const);
        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global_idx, is_const);
    }

    fn fun_declaration(&mut self) {
        let global_idx = self.parse_variable("Expect function name.", false);
        self.mark_initialized();
        let name = self.previous.lexeme.to_owned();
        self.function(FunctionType::Function, Some(name));
        self.define_variable(global_idx, false);
    }

    fn function(&mut self, ftype: FunctionType, name: Option<String>) {
        let name_id = name.as_deref().map(|n| self.heap.intern_string(n));
        self.frames.push(FrameState::new(ftype, name_id));
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            let mut param_count = 0usize;
            loop {
                param_count += 1;
                if param_count > MAX_PARAMS {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_frame_mut().function.arity += 1;
                }
                let const_idx = self.parse_variable("Expect parameter name.", false);
                self.define_variable(const_idx, false);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function_id, upvalues) = self.end_compiler();
        let const_idx = match self.current_chunk_mut().add_constant(Value::Obj(function_id)) {
            Ok(idx) => idx,
            Err(message) => {
                self.error(&message);
                return;
            }
        };
        self.emit_byte(OpCode::Closure);
        self.emit_u16(const_idx as u16);
        for up in upvalues {
            self.emit_u8(u8::from(up.is_local));
            self.emit_u16(u16::from(up.index));
        }
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_owned();
        let name_const = self.identifier_constant(&name);
        let ftype = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(ftype, Some(name));
        self.emit_byte(OpCode::Method);
        self.emit_name_byte(name_const);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_owned();
        let class_name_const = self.identifier_constant(&class_name);
        self.declare_variable(&class_name, false);

        self.emit_byte(OpCode::Class);
        self.emit_name_byte(class_name_const);
        let global_idx =
            if self.current_frame().scope_depth == 0 { self.resolve_global(&class_name) } else { 0 };
        self.define_variable(global_idx, false);

        self.class_stack.push(ClassCompiler { has_superclass: false });

        if self.matches(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.to_owned();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&super_name, false);

            self.begin_scope();
            self.add_local("super", false);
            self.mark_initialized();

            self.named_variable(&class_name, false);
            self.emit_byte(OpCode::Inherit);
            self.class_stack.last_mut().expect("just pushed").has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop);

        if self.class_stack.last().expect("just pushed").has_superclass {
            self.end_scope();
        }
        self.class_stack.pop();
    }

    // --- statements -------------------------------------------------

    fn statement(&mut self) {
        if self.matches(TokenType::Print) {
            self.print_statement();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::Switch) {
            self.switch_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::Break) {
            self.break_statement();
        } else if self.matches(TokenType::Continue) {
            self.continue_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop);
    }

    fn return_statement(&mut self) {
        if self.current_frame().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_frame().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return);
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'break'.");
        let Some(breakable) = self.breakables.last() else {
            self.error("Cannot use 'break' outside a loop or switch.");
            return;
        };
        let depth = breakable.locals_depth;
        self.emit_unwind_to(depth);
        let jump = self.emit_jump(OpCode::Jmp);
        self.breakables.last_mut().expect("checked above").break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.");
        let target = self.breakables.iter().rev().find_map(|b| b.continue_target.map(|t| (t, b.locals_depth)));
        match target {
            None => self.error("Cannot use 'continue' outside a loop."),
            Some((loop_start, depth)) => {
                self.emit_unwind_to(depth);
                self.emit_loop(loop_start);
            }
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JmpFalse);
        self.emit_byte(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jmp);
        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop);

        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code_len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JmpFalse);
        self.emit_byte(OpCode::Pop);

        self.breakables.push(Breakable {
            continue_target: Some(loop_start),
            break_jumps: Vec::new(),
            locals_depth: self.current_frame().locals.len(),
        });
        self.statement();
        let breakable = self.breakables.pop().expect("just pushed");

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop);

        for j in breakable.break_jumps {
            self.patch_jump(j);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");

        let mut loop_var_slot = None;
        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Var) {
            self.var_declaration(false);
            loop_var_slot = Some(self.current_frame().locals.len() - 1);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code_len();
        let mut exit_jump = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JmpFalse));
            self.emit_byte(OpCode::Pop);
        }

        if !self.matches(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jmp);
            let increment_start = self.current_chunk().code_len();
            self.expression();
            self.emit_byte(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.breakables.push(Breakable {
            continue_target: Some(loop_start),
            break_jumps: Vec::new(),
            locals_depth: self.current_frame().locals.len(),
        });

        if let Some(outer_slot) = loop_var_slot {
            // Each iteration gets its own shadow local aliasing the loop
            // variable, so a closure formed inside the body captures that
            // iteration's value rather than the one shared mutable slot.
            self.begin_scope();
            self.emit_byte(OpCode::GetLocal);
            self.emit_u8(outer_slot as u8);
            let name = self.current_frame().locals[outer_slot].name.clone();
            self.add_local(&name, false);
            self.mark_initialized();
            let shadow_slot = self.current_frame().locals.len() - 1;

            self.statement();

            self.emit_byte(OpCode::GetLocal);
            self.emit_u8(shadow_slot as u8);
            self.emit_byte(OpCode::SetLocal);
            self.emit_u8(outer_slot as u8);
            self.emit_byte(OpCode::Pop);
            self.end_scope();
        } else {
            self.statement();
        }

        let breakable = self.breakables.pop().expect("just pushed");
        self.emit_loop(loop_start);

        if let Some(j) = exit_jump {
            self.patch_jump(j);
            self.emit_byte(OpCode::Pop);
        }
        for j in breakable.break_jumps {
            self.patch_jump(j);
        }

        self.end_scope();
    }

    fn switch_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after switch value.");
        self.consume(TokenType::LeftBrace, "Expect '{' before switch body.");

        self.breakables.push(Breakable {
            continue_target: None,
            break_jumps: Vec::new(),
            locals_depth: self.current_frame().locals.len(),
        });

        let mut default_body_start = None;
        let mut default_seen = false;
        let mut pending_fail_jump = None;

        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if self.matches(TokenType::Case) {
                if let Some(prev) = pending_fail_jump.take() {
                    self.patch_jump(prev);
                    self.emit_byte(OpCode::Pop);
                }
                self.emit_byte(OpCode::Dup);
                self.expression();
                self.consume(TokenType::Colon, "Expect ':' after case value.");
                self.emit_byte(OpCode::Eq);
                let fail_jump = self.emit_jump(OpCode::JmpFalse);
                self.emit_byte(OpCode::Pop);
                self.case_body();
                let end_jump = self.emit_jump(OpCode::Jmp);
                self.breakables.last_mut().expect("just pushed").break_jumps.push(end_jump);
                pending_fail_jump = Some(fail_jump);
            } else if self.matches(TokenType::Default) {
                if default_seen {
                    self.error("A switch may have only one 'default' clause.");
                }
                default_seen = true;
                if let Some(prev) = pending_fail_jump.take() {
                    self.patch_jump(prev);
                    self.emit_byte(OpCode::Pop);
                }
                self.consume(TokenType::Colon, "Expect ':' after 'default'.");
                let guard_jump = self.emit_jump(OpCode::Jmp);
                default_body_start = Some(self.current_chunk().code_len());
                self.case_body();
                let end_jump = self.emit_jump(OpCode::Jmp);
                self.breakables.last_mut().expect("just pushed").break_jumps.push(end_jump);
                self.patch_jump(guard_jump);
            } else {
                self.error_at_current("Expect 'case' or 'default' inside switch body.");
                self.advance();
            }
        }

        if let Some(prev) = pending_fail_jump.take() {
            self.patch_jump(prev);
            self.emit_byte(OpCode::Pop);
        }
        if let Some(start) = default_body_start {
            self.emit_loop(start);
        }

        self.consume(TokenType::RightBrace, "Expect '}' after switch body.");
        self.emit_byte(OpCode::Pop);

        let breakable = self.breakables.pop().expect("just pushed");
        for j in breakable.break_jumps {
            self.patch_jump(j);
        }
    }

    fn case_body(&mut self) {
        while !self.check(TokenType::Case)
            && !self.check(TokenType::Default)
            && !self.check(TokenType::RightBrace)
            && !self.check(TokenType::Eof)
        {
            self.statement();
        }
    }

    // --- expressions -------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        let prefix_kind = self.previous.kind;
        if !self.call_prefix(prefix_kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= precedence_of(self.current.kind) {
            self.advance();
            let infix_kind = self.previous.kind;
            self.call_infix(infix_kind, can_assign);
        }

        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn call_prefix(&mut self, kind: TokenType, can_assign: bool) -> bool {
        match kind {
            TokenType::LeftParen => self.grouping(),
            TokenType::Minus | TokenType::Bang => self.unary(),
            TokenType::Number => self.number(),
            TokenType::String => self.string_literal(),
            TokenType::True | TokenType::False | TokenType::Nil => self.literal(),
            TokenType::Identifier => self.variable(can_assign),
            TokenType::This => self.this_expr(),
            TokenType::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn call_infix(&mut self, kind: TokenType, can_assign: bool) {
        match kind {
            TokenType::Minus
            | TokenType::Plus
            | TokenType::Slash
            | TokenType::Star
            | TokenType::Percent
            | TokenType::BangEqual
            | TokenType::EqualEqual
            | TokenType::Greater
            | TokenType::GreaterEqual
            | TokenType::Less
            | TokenType::LessEqual => self.binary(),
            TokenType::And => self.and_expr(),
            TokenType::Or => self.or_expr(),
            TokenType::LeftParen => self.call_expr(),
            TokenType::Dot => self.dot_expr(can_assign),
            _ => {}
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().expect("scanner guarantees a valid number lexeme");
        self.emit_constant(Value::Number(value));
    }

    fn string_literal(&mut self) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let id = self.heap.intern_string(content);
        self.emit_constant(Value::Obj(id));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenType::False => self.emit_byte(OpCode::False),
            TokenType::True => self.emit_byte(OpCode::True),
            TokenType::Nil => self.emit_byte(OpCode::Nil),
            _ => unreachable!("literal() only dispatched for these token kinds"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenType::Minus => self.emit_byte(OpCode::Negate),
            TokenType::Bang => self.emit_byte(OpCode::Not),
            _ => unreachable!("unary() only dispatched for these token kinds"),
        }
    }

    fn binary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(precedence_of(op_kind).next());
        match op_kind {
            TokenType::BangEqual => self.emit_byte(OpCode::Neq),
            TokenType::EqualEqual => self.emit_byte(OpCode::Eq),
            TokenType::Greater => self.emit_byte(OpCode::Greater),
            TokenType::GreaterEqual => self.emit_byte(OpCode::GreaterEq),
            TokenType::Less => self.emit_byte(OpCode::Less),
            TokenType::LessEqual => self.emit_byte(OpCode::LessEq),
            TokenType::Plus => self.emit_byte(OpCode::Add),
            TokenType::Minus => self.emit_byte(OpCode::Sub),
            TokenType::Star => self.emit_byte(OpCode::Mul),
            TokenType::Slash => self.emit_byte(OpCode::Div),
            TokenType::Percent => self.emit_byte(OpCode::Mod),
            _ => unreachable!("binary() only dispatched for these token kinds"),
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JmpFalse);
        self.emit_byte(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let true_jump = self.emit_jump(OpCode::JmpTrue);
        self.emit_byte(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(true_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_owned();
        self.named_variable(&name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.class_stack.last().expect("checked above").has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let method_name = self.previous.lexeme.to_owned();
        let name_const = self.identifier_constant(&method_name);

        self.named_variable("this", false);
        if self.matches(TokenType::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_byte(OpCode::SuperInvoke);
            self.emit_name_byte(name_const);
            self.emit_u8(argc);
        } else {
            self.named_variable("super", false);
            self.emit_byte(OpCode::GetSuper);
            self.emit_name_byte(name_const);
        }
    }

    fn dot_expr(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_owned();
        let name_const = self.identifier_constant(&name);

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_byte(OpCode::SetProperty);
            self.emit_name_byte(name_const);
        } else if self.matches(TokenType::LeftParen) {
            let argc = self.argument_list();
            self.emit_byte(OpCode::Invoke);
            self.emit_name_byte(name_const);
            self.emit_u8(argc);
        } else {
            self.emit_byte(OpCode::GetProperty);
            self.emit_name_byte(name_const);
        }
    }

    fn call_expr(&mut self) {
        let argc = self.argument_list();
        self.emit_byte(OpCode::Call);
        self.emit_u8(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count = 0usize;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> ObjectId {
        let mut heap = Heap::new();
        let mut globals = Globals::new();
        compile(source, &mut heap, &mut globals).unwrap_or_else(|errs| {
            panic!("expected compile success, got errors: {errs:?}");
        })
    }

    fn compile_err(source: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        let mut globals = Globals::new();
        compile(source, &mut heap, &mut globals).expect_err("expected a compile error")
    }

    #[test]
    fn compiles_trivial_expression_statement() {
        compile_ok("1 + 2;");
    }

    #[test]
    fn compiles_function_and_call() {
        compile_ok("fun add(a, b) { return a + b; } print add(1, 2);");
    }

    #[test]
    fn compiles_class_with_inheritance() {
        compile_ok("class A { greet() { print \"hi\"; } } class B < A {} B().greet();");
    }

    #[test]
    fn const_reassignment_is_a_compile_error() {
        let errors = compile_err("const PI = 3.14; PI = 3;");
        assert!(errors.iter().any(|e| e.message.contains("Cannot re-assign const variable")));
    }

    #[test]
    fn undefined_expression_is_a_compile_error() {
        let errors = compile_err("1 + ;");
        assert!(!errors.is_empty());
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let errors = compile_err("break;");
        assert!(errors.iter().any(|e| e.message.contains("break")));
    }

    #[test]
    fn two_hundred_fifty_six_locals_compile() {
        let mut source = String::from("{ ");
        for i in 0..256 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push('}');
        compile_ok(&source);
    }

    #[test]
    fn two_hundred_fifty_seven_locals_do_not_compile() {
        let mut source = String::from("{ ");
        for i in 0..257 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push('}');
        let errors = compile_err(&source);
        assert!(errors.iter().any(|e| e.message.contains("Too many local variables")));
    }

    #[test]
    fn switch_with_default_not_last_compiles() {
        compile_ok(
            "var x = 1; switch (x) { case 1: print 1; default: print 0; case 2: print 2; }",
        );
    }
}
