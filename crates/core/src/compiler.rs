//! Single-pass compiler: source text to a top-level function.
//!
//! A Pratt parser drives bytecode emission directly; there is no AST.
//! Operators are not special-formed: every binary and unary operator
//! lowers to an INVOKE send (`"+"`, `"<"`, `"neg"`, ...), dot access
//! lowers to `getSlot`/`setSlot` sends, and a call expression lowers to a
//! `call` send on the callee. The interesting machinery is lexical: local
//! slots, scope depth, and upvalue resolution across enclosing functions.
//!
//! Errors accumulate in panic mode: the first error in a statement
//! reports, the rest are suppressed until a synchronization point.
//!
//! Heap values created while compiling (interned names, literals, finished
//! functions) are parked in the VM's compiler root buffer so a collection
//! triggered mid-compile can reach them.

use tracing::debug;

use crate::chunk::OpCode;
use crate::debug as disasm;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::memory;
use crate::object::{ObjBody, ObjFunction, ObjRef};
use crate::value::Value;
use crate::vm::Vm;

/// Compile `source` into a zero-arity script function. Returns `None`
/// after reporting one or more compile errors; no bytecode runs then.
pub(crate) fn compile(vm: &mut Vm, source: &str) -> Option<ObjRef> {
    vm.compiler_roots.clear();

    let placeholder = Token {
        kind: TokenKind::Eof,
        text: "",
        line: 1,
    };
    let mut compiler = Compiler {
        vm,
        lexer: Lexer::new(source),
        current: placeholder,
        previous: placeholder,
        states: vec![FnState::new(None)],
        had_error: false,
        panic_mode: false,
    };

    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.emit_op(OpCode::Nil);
    compiler.emit_op(OpCode::Return);

    let had_error = compiler.had_error;
    let (function, _) = compiler.end_function();
    if had_error {
        return None;
    }
    if tracing::enabled!(tracing::Level::DEBUG) {
        // Safety: the finished function is parked in the compiler roots.
        let chunk = unsafe { &function.function().chunk };
        debug!(target: "sable::code", "\n{}", disasm::disassemble_chunk(chunk, "script"));
    }
    Some(function)
}

// ----------------------------------------------------------------------
// Compiler state
// ----------------------------------------------------------------------

struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. Nested `fn` expressions push and pop
/// these; emission always targets the innermost one.
struct FnState<'src> {
    chunk: crate::chunk::Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    arity: u8,
    name: Option<ObjRef>,
}

impl<'src> FnState<'src> {
    fn new(name: Option<ObjRef>) -> FnState<'src> {
        FnState {
            chunk: crate::chunk::Chunk::new(),
            // Slot 0 belongs to the receiver; `this` resolves to it.
            locals: vec![Local {
                name: "this",
                depth: 0,
                captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            arity: 0,
            name,
        }
    }
}

struct Compiler<'vm, 'src> {
    vm: &'vm mut Vm,
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    states: Vec<FnState<'src>>,
    had_error: bool,
    panic_mode: bool,
}

// ----------------------------------------------------------------------
// Pratt rules
// ----------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // () .
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call => Prec::Call,
        }
    }
}

type ParseFn<'vm, 'src> = fn(&mut Compiler<'vm, 'src>, bool);

struct Rule<'vm, 'src> {
    prefix: Option<ParseFn<'vm, 'src>>,
    infix: Option<ParseFn<'vm, 'src>>,
    precedence: Prec,
}

fn get_rule<'vm, 'src>(kind: TokenKind) -> Rule<'vm, 'src> {
    use TokenKind::*;
    let (prefix, infix, precedence): (
        Option<ParseFn<'vm, 'src>>,
        Option<ParseFn<'vm, 'src>>,
        Prec,
    ) = match kind {
        LParen => (Some(grouping), Some(call), Prec::Call),
        LBrace => (Some(object_literal), None, Prec::None),
        Dot => (None, Some(dot), Prec::Call),
        Minus => (Some(unary), Some(binary), Prec::Term),
        Plus => (None, Some(binary), Prec::Term),
        Star | Slash => (None, Some(binary), Prec::Factor),
        Bang => (Some(unary), None, Prec::None),
        EqEq | BangEq => (None, Some(binary), Prec::Equality),
        Lt | LtEq | Gt | GtEq => (None, Some(binary), Prec::Comparison),
        And => (None, Some(and_expr), Prec::And),
        Or => (None, Some(or_expr), Prec::Or),
        Number => (Some(number), None, Prec::None),
        Str => (Some(string), None, Prec::None),
        Ident => (Some(variable), None, Prec::None),
        True | False | Nil => (Some(literal), None, Prec::None),
        This => (Some(this_expr), None, Prec::None),
        Super => (Some(super_expr), None, Prec::None),
        Fn => (Some(fn_expr), None, Prec::None),
        _ => (None, None, Prec::None),
    };
    Rule {
        prefix,
        infix,
        precedence,
    }
}

// ----------------------------------------------------------------------
// Expression handlers
// ----------------------------------------------------------------------

fn grouping<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RParen, "Expect ')' after expression.");
}

fn number<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    match c.previous.text.parse::<f64>() {
        Ok(n) => c.emit_constant(Value::Number(n)),
        Err(_) => c.error("Invalid number literal."),
    }
}

fn string<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    let text = c.previous.text;
    let inner = &text[1..text.len() - 1];
    let value = c.vm.intern(inner);
    c.emit_constant(value);
}

fn literal<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    match c.previous.kind {
        TokenKind::True => c.emit_op(OpCode::True),
        TokenKind::False => c.emit_op(OpCode::False),
        TokenKind::Nil => c.emit_op(OpCode::Nil),
        _ => unreachable!(),
    }
}

fn variable<'vm, 'src>(c: &mut Compiler<'vm, 'src>, can_assign: bool) {
    let token = c.previous;
    c.named_variable(token, can_assign);
}

fn this_expr<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    let token = c.previous;
    c.named_variable(
        Token {
            kind: TokenKind::Ident,
            text: "this",
            line: token.line,
        },
        false,
    );
}

/// `super` is sugar for a `proto` send on `this`.
fn super_expr<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    this_expr(c, false);
    let key = c.vm.intern("proto");
    c.emit_invoke(key, 0);
}

fn fn_expr<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    c.function(None);
}

fn unary<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    let op = c.previous.kind;
    c.parse_precedence(Prec::Unary);
    let key = match op {
        TokenKind::Minus => c.vm.intern("neg"),
        TokenKind::Bang => c.vm.cached.not,
        _ => unreachable!(),
    };
    c.emit_invoke(key, 0);
}

fn binary<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    let op = c.previous.kind;
    let precedence = get_rule(op).precedence;
    c.parse_precedence(precedence.next());
    let key = match op {
        TokenKind::Plus => c.vm.intern("+"),
        TokenKind::Minus => c.vm.intern("-"),
        TokenKind::Star => c.vm.intern("*"),
        TokenKind::Slash => c.vm.intern("/"),
        TokenKind::Lt => c.vm.intern("<"),
        TokenKind::Gt => c.vm.intern(">"),
        TokenKind::LtEq => c.vm.intern("<="),
        TokenKind::GtEq => c.vm.intern(">="),
        TokenKind::EqEq => c.vm.cached.eq,
        TokenKind::BangEq => c.vm.cached.neq,
        _ => unreachable!(),
    };
    c.emit_invoke(key, 1);
}

fn and_expr<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    let end = c.emit_jump(OpCode::JumpIfFalse);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Prec::And);
    c.patch_jump(end);
}

fn or_expr<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    let end = c.emit_jump(OpCode::JumpIfTrue);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Prec::Or);
    c.patch_jump(end);
}

/// `callee(args...)` lowers to a `call` send with the callee as receiver.
fn call<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    let argc = c.argument_list();
    let key = c.vm.intern("call");
    c.emit_invoke(key, argc);
}

fn dot<'vm, 'src>(c: &mut Compiler<'vm, 'src>, can_assign: bool) {
    c.consume(TokenKind::Ident, "Expect slot name after '.'.");
    let name = c.previous.text;
    let key = c.vm.intern(name);
    if can_assign && c.matches(TokenKind::Eq) {
        // receiver . name = value  =>  [receiver, name, value] setSlot
        c.emit_constant(key);
        c.expression();
        let set_slot = c.vm.cached.set_slot;
        c.emit_invoke(set_slot, 2);
    } else if c.matches(TokenKind::LParen) {
        let argc = c.argument_list();
        c.emit_invoke(key, argc);
    } else {
        // receiver . name  =>  [receiver, name] getSlot
        c.emit_constant(key);
        let get_slot = c.vm.cached.get_slot;
        c.emit_invoke(get_slot, 1);
    }
}

fn object_literal<'vm, 'src>(c: &mut Compiler<'vm, 'src>, _can_assign: bool) {
    c.emit_op(OpCode::Object);
    if !c.check(TokenKind::RBrace) {
        loop {
            if c.matches(TokenKind::Ident) {
                // Identifier keys use the constant-keyed form.
                let name = c.previous.text;
                let key = c.vm.intern(name);
                let index = c.make_constant(key);
                c.consume(TokenKind::Colon, "Expect ':' after slot name.");
                c.expression();
                c.emit_op(OpCode::ObjectSet);
                c.emit_u16(index);
            } else if c.matches(TokenKind::Str) {
                let text = c.previous.text;
                let key = c.vm.intern(&text[1..text.len() - 1]);
                c.emit_constant(key);
                c.consume(TokenKind::Colon, "Expect ':' after slot name.");
                c.expression();
                c.emit_op(OpCode::ObjLitSet);
            } else if c.matches(TokenKind::Number) {
                number(c, false);
                c.consume(TokenKind::Colon, "Expect ':' after slot name.");
                c.expression();
                c.emit_op(OpCode::ObjLitSet);
            } else {
                c.error_at_current("Expect slot name.");
                break;
            }
            if !c.matches(TokenKind::Comma) {
                break;
            }
            if c.check(TokenKind::RBrace) {
                break;
            }
        }
    }
    c.consume(TokenKind::RBrace, "Expect '}' after object literal.");
}

// ----------------------------------------------------------------------
// Compiler proper
// ----------------------------------------------------------------------

impl<'vm, 'src> Compiler<'vm, 'src> {
    // -- token plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.text;
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // -- diagnostics ----------------------------------------------------

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        match token.kind {
            TokenKind::Eof => eprintln!("[line {}] Error at end: {}", token.line, message),
            TokenKind::Error => eprintln!("[line {}] Error: {}", token.line, message),
            _ => eprintln!("[line {}] Error at '{}': {}", token.line, token.text, message),
        }
    }

    /// Skip to a statement boundary after a panic, so one mistake doesn't
    /// cascade into a wall of diagnostics.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Let
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Assert
                | TokenKind::Fn => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- emission -------------------------------------------------------

    fn state(&mut self) -> &mut FnState<'src> {
        self.states.last_mut().expect("no function state")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.state().chunk.write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.state().chunk.write_op(op, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.state().chunk.write_u16(value, line);
    }

    /// Intern a value into the current constant pool, de-duplicating, and
    /// park it in the compiler roots so a mid-compile collection sees it.
    fn make_constant(&mut self, value: Value) -> u16 {
        self.vm.compiler_roots.push(value);
        let state = self.states.last_mut().expect("no function state");
        if let Some(index) = state.chunk.constants.iter().position(|&c| c == value) {
            return index as u16;
        }
        let index = state.chunk.add_constant(value);
        if index > u16::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u16
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_u16(index);
    }

    fn emit_invoke(&mut self, key: Value, argc: u8) {
        let index = self.make_constant(key);
        self.emit_op(OpCode::Invoke);
        self.emit_u16(index);
        self.emit_byte(argc);
    }

    fn current_offset(&mut self) -> usize {
        self.state().chunk.code.len()
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_u16(0xffff);
        self.current_offset() - 2
    }

    fn patch_jump(&mut self, operand_at: usize) {
        let jump = self.current_offset() - operand_at - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let code = &mut self.state().chunk.code;
        code[operand_at] = (jump >> 8) as u8;
        code[operand_at + 1] = jump as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let offset = self.current_offset() - loop_start + 3;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        self.emit_op(OpCode::Loop);
        self.emit_u16(offset as u16);
    }

    // -- scopes and locals ----------------------------------------------

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state().scope_depth -= 1;
        loop {
            let state = self.states.last().expect("no function state");
            let Some(local) = state.locals.last() else {
                break;
            };
            if local.depth <= state.scope_depth {
                break;
            }
            let captured = local.captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state().locals.pop();
        }
    }

    fn declare_local(&mut self, name: &'src str) {
        let state = self.states.last().expect("no function state");
        let mut duplicate = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        if self.states.last().expect("no function state").locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.state().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let depth = self.state().scope_depth;
        if let Some(local) = self.state().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (i, local) in self.states[state_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i, local.depth));
                break;
            }
        }
        let (index, depth) = found?;
        if depth == -1 {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(index as u8)
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        if let Some(i) = self.states[state_idx].upvalues.iter().position(|&u| u == desc) {
            return i as u8;
        }
        if self.states[state_idx].upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.states[state_idx].upvalues.push(desc);
        (self.states[state_idx].upvalues.len() - 1) as u8
    }

    /// Look for `name` as a local of an enclosing function, capturing it
    /// through every intermediate function on the way in.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(state_idx - 1, name) {
            self.states[state_idx - 1].locals[local as usize].captured = true;
            return Some(self.add_upvalue(state_idx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(state_idx - 1, name) {
            return Some(self.add_upvalue(state_idx, upvalue, false));
        }
        None
    }

    fn named_variable(&mut self, token: Token<'src>, can_assign: bool) {
        let name = token.text;
        let state_idx = self.states.len() - 1;
        if let Some(slot) = self.resolve_local(state_idx, name) {
            if can_assign && self.matches(TokenKind::Eq) {
                self.expression();
                self.emit_op(OpCode::SetLocal);
                self.emit_byte(slot);
            } else {
                self.emit_op(OpCode::GetLocal);
                self.emit_byte(slot);
            }
        } else if let Some(index) = self.resolve_upvalue(state_idx, name) {
            if can_assign && self.matches(TokenKind::Eq) {
                self.expression();
                self.emit_op(OpCode::SetUpvalue);
                self.emit_byte(index);
            } else {
                self.emit_op(OpCode::GetUpvalue);
                self.emit_byte(index);
            }
        } else {
            let key = self.vm.intern(name);
            let constant = self.make_constant(key);
            if can_assign && self.matches(TokenKind::Eq) {
                self.expression();
                self.emit_op(OpCode::SetGlobal);
                self.emit_u16(constant);
            } else {
                self.emit_op(OpCode::GetGlobal);
                self.emit_u16(constant);
            }
        }
    }

    // -- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Prec) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Prec::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.previous.kind)
                .infix
                .expect("token with infix precedence has infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Eq) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: usize = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.expression();
                if argc == u8::MAX as usize {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expect ')' after arguments.");
        argc.min(u8::MAX as usize) as u8
    }

    // -- functions ------------------------------------------------------

    /// Compile a `fn` expression. The parameter list and body compile into
    /// a fresh state; the CLOSURE instruction lands in the enclosing one.
    fn function(&mut self, name: Option<ObjRef>) {
        if let Some(n) = name {
            self.vm.compiler_roots.push(Value::Obj(n));
        }
        self.states.push(FnState::new(name));
        self.begin_scope();

        self.consume(TokenKind::LParen, "Expect '(' after 'fn'.");
        if !self.check(TokenKind::RParen) {
            loop {
                self.consume(TokenKind::Ident, "Expect parameter name.");
                let param = self.previous.text;
                self.declare_local(param);
                self.mark_initialized();
                if self.state().arity == u8::MAX {
                    self.error("Can't have more than 255 parameters.");
                } else {
                    self.state().arity += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LBrace, "Expect '{' before function body.");
        self.function_body();

        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op(OpCode::Closure);
        self.emit_u16(constant);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    /// Statements until `}`. A trailing expression with no semicolon is
    /// the function's return value; otherwise the function returns nil.
    fn function_body(&mut self) {
        loop {
            if self.check(TokenKind::RBrace) || self.check(TokenKind::Eof) {
                self.emit_op(OpCode::Nil);
                break;
            }
            if self.check(TokenKind::Let)
                || self.check(TokenKind::If)
                || self.check(TokenKind::While)
                || self.check(TokenKind::Return)
                || self.check(TokenKind::Assert)
                || self.check(TokenKind::LBrace)
            {
                self.declaration();
                continue;
            }
            self.expression();
            if self.matches(TokenKind::Semicolon) {
                self.emit_op(OpCode::Pop);
                continue;
            }
            if !self.check(TokenKind::RBrace) {
                self.error_at_current("Expect ';' after expression.");
            }
            break;
        }
        self.consume(TokenKind::RBrace, "Expect '}' after function body.");
        self.emit_op(OpCode::Return);
    }

    /// Pop the innermost state and seal it into a function object. The
    /// object is parked in the compiler roots immediately, so it survives
    /// until the enclosing chunk (or the interpreter) takes it over.
    fn end_function(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        let state = self.states.pop().expect("no function state");
        let upvalue_count = state.upvalues.len();
        let function = memory::allocate(
            self.vm,
            ObjBody::Function(ObjFunction {
                arity: state.arity,
                upvalue_count,
                name: state.name,
                chunk: state.chunk,
            }),
        );
        self.vm.compiler_roots.push(Value::Obj(function));
        (function, state.upvalues)
    }

    // -- statements -----------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Let) {
            self.let_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Assert) {
            self.assert_statement();
        } else if self.matches(TokenKind::LBrace) {
            self.block();
        } else {
            self.expression_statement();
        }
    }

    /// `;` closes a statement; it may be omitted before `}` or at end of
    /// input.
    fn statement_terminator(&mut self) {
        if self.matches(TokenKind::Semicolon) {
            return;
        }
        if self.check(TokenKind::RBrace) || self.check(TokenKind::Eof) {
            return;
        }
        self.error_at_current("Expect ';' after statement.");
    }

    fn let_declaration(&mut self) {
        self.consume(TokenKind::Ident, "Expect variable name.");
        let name_token = self.previous;
        let is_local = self.state().scope_depth > 0;
        if is_local {
            self.declare_local(name_token.text);
        }

        if self.matches(TokenKind::Eq) {
            if self.check(TokenKind::Fn) {
                // Bind the variable's name to the function for diagnostics.
                self.advance();
                let name = self.vm.intern_ref(name_token.text);
                self.function(Some(name));
            } else {
                self.expression();
            }
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.statement_terminator();

        if is_local {
            // The value stays on the stack: that slot is the local.
            self.mark_initialized();
        } else {
            let key = self.vm.intern(name_token.text);
            let constant = self.make_constant(key);
            self.emit_op(OpCode::DefGlobal);
            self.emit_u16(constant);
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.statement_terminator();
        self.emit_op(OpCode::Pop);
    }

    fn assert_statement(&mut self) {
        self.expression();
        self.statement_terminator();
        self.emit_op(OpCode::Assert);
    }

    fn return_statement(&mut self) {
        if self.matches(TokenKind::Semicolon) {
            self.emit_op(OpCode::Nil);
        } else if self.check(TokenKind::RBrace) || self.check(TokenKind::Eof) {
            self.emit_op(OpCode::Nil);
        } else {
            self.expression();
            self.statement_terminator();
        }
        self.emit_op(OpCode::Return);
    }

    fn if_statement(&mut self) {
        self.expression();
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::LBrace, "Expect '{' after condition.");
        self.block();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            if self.matches(TokenKind::If) {
                self.if_statement();
            } else {
                self.consume(TokenKind::LBrace, "Expect '{' after 'else'.");
                self.block();
            }
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_offset();
        self.expression();
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::LBrace, "Expect '{' after condition.");
        self.block();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn block(&mut self) {
        self.begin_scope();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RBrace, "Expect '}' after block.");
        self.end_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(source: &str) -> (Vm, Option<ObjRef>) {
        let mut vm = Vm::new();
        let function = compile(&mut vm, source);
        (vm, function)
    }

    #[test]
    fn empty_program_compiles() {
        let (_vm, function) = compile_source("");
        let function = function.unwrap();
        // Safety: still parked in the compiler roots.
        let f = unsafe { function.function() };
        assert_eq!(f.arity, 0);
        assert_eq!(f.upvalue_count, 0);
        // NIL + RETURN at minimum.
        assert!(f.chunk.code.len() >= 2);
    }

    #[test]
    fn syntax_error_returns_none() {
        let (_vm, function) = compile_source("let = 3;");
        assert!(function.is_none());
    }

    #[test]
    fn unterminated_string_is_a_compile_error() {
        let (_vm, function) = compile_source("let s = \"oops");
        assert!(function.is_none());
    }

    #[test]
    fn undefined_assignment_target_is_an_error() {
        let (_vm, function) = compile_source("1 + 2 = 3;");
        assert!(function.is_none());
    }

    #[test]
    fn duplicate_local_is_an_error() {
        let (_vm, function) = compile_source("let f = fn() { let a = 1; let a = 2; };");
        assert!(function.is_none());
    }

    #[test]
    fn closure_upvalue_counting() {
        let (_vm, function) =
            compile_source("let outer = fn() { let n = 0; fn() { n = n + 1; n } };");
        assert!(function.is_some());
    }

    #[test]
    fn constants_are_deduplicated() {
        let (_vm, function) = compile_source("let a = 1; let b = 1; let c = 1;");
        let function = function.unwrap();
        // Safety: still parked in the compiler roots.
        let f = unsafe { function.function() };
        let ones = f
            .chunk
            .constants
            .iter()
            .filter(|&&v| v == Value::Number(1.0))
            .count();
        assert_eq!(ones, 1);
    }

    #[test]
    fn panic_mode_recovers_per_statement() {
        // Two distinct malformed statements; both should be reported (and
        // compilation still fails), rather than the first one cascading.
        let (_vm, function) = compile_source("let 1; let 2;");
        assert!(function.is_none());
    }
}
