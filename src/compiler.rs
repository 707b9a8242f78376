// File: src/compiler.rs
//
// Single-pass Pratt compiler for Ember. There is no intermediate AST: every
// parse function emits directly into the Chunk of whatever function is
// currently being compiled.

use std::rc::Rc;

use crate::chunk::{Chunk, OpCode};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::value::{ObjFunction, ReturnType, UpvalueDescriptor, Value};
use crate::vm::Vm;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Bitwise,    // & | ^ << >> ~        (idiosyncratic: sits above Factor)
    Unary,      // ! - ~
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Bitwise,
            Bitwise => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

/// One function's in-progress compilation state. The compiler keeps a stack
/// of these (innermost last) instead of a C-style `enclosing`-linked list,
/// so "the enclosing compiler" is simply `self.functions[index - 1]`.
struct FunctionState<'src> {
    name: Option<Rc<str>>,
    arity: u16,
    chunk: Chunk,
    return_type: Option<ReturnType>,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: i32,
    /// The opcode of the most recently emitted instruction, tracked
    /// explicitly rather than recovered by peeking at the chunk's last
    /// byte: for `OP_CONSTANT`/`OP_CONSTANT_LONG` that byte is an operand,
    /// not the opcode. Used by the shallow return-type check.
    last_opcode: Option<OpCode>,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind) -> Self {
        // Slot 0 is reserved: empty/unreachable for plain functions and the
        // top-level script, `this` for methods and initializers.
        let slot0 = if kind == FunctionKind::Function || kind == FunctionKind::Script { "" } else { "this" };
        FunctionState {
            name: None,
            arity: 0,
            chunk: Chunk::new(),
            return_type: None,
            kind,
            locals: vec![Local { name: slot0, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
            last_opcode: None,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

type PrefixFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);
type InfixFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);

struct ParseRule<'src, 'vm> {
    prefix: Option<PrefixFn<'src, 'vm>>,
    infix: Option<InfixFn<'src, 'vm>>,
    precedence: Precedence,
}

/// Compiles one source string into a top-level `ObjFunction`. Holds the VM
/// for the compilation's whole duration: string constants must come out of
/// the VM's interner (so literal equality is later pointer equality) and an
/// `import` declaration drives the VM to compile-and-run another source
/// file synchronously before compilation of the importing file continues.
pub struct Compiler<'src, 'vm> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    functions: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
    vm: &'vm mut Vm,
}

impl<'src, 'vm> Compiler<'src, 'vm> {
    fn new(source: &'src str, vm: &'vm mut Vm) -> Self {
        let mut lexer = Lexer::new(source);
        let first = lexer.scan_token();
        Compiler {
            lexer,
            previous: first,
            current: first,
            had_error: false,
            panic_mode: false,
            functions: vec![FunctionState::new(FunctionKind::Script)],
            classes: Vec::new(),
            vm,
        }
    }

    // ---- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
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

    // ---- error reporting ----------------------------------------------

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = if token.kind == TokenKind::Eof {
            crate::errors::ErrorLocation::AtEnd
        } else if token.kind == TokenKind::Error {
            crate::errors::ErrorLocation::None
        } else {
            crate::errors::ErrorLocation::At(token.lexeme)
        };
        self.vm.report_compile_error(token.line, location, message);
        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    // ---- emission -------------------------------------------------------

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.functions.last_mut().unwrap().chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
        self.functions.last_mut().unwrap().last_opcode = Some(op);
    }

    fn emit_bytes(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_return(&mut self) {
        if self.functions.last().unwrap().kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let chunk = self.current_chunk();
        let index = chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        let op = self.current_chunk().write_constant(value, line);
        self.functions.last_mut().unwrap().last_opcode = Some(op);
    }

    // ---- scopes -----------------------------------------------------

    fn begin_scope(&mut self) {
        self.functions.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let func = self.functions.last_mut().unwrap();
            func.scope_depth -= 1;
            func.scope_depth
        };
        loop {
            let should_pop = {
                let func = self.functions.last().unwrap();
                match func.locals.last() {
                    Some(local) => local.depth > depth,
                    None => false,
                }
            };
            if !should_pop {
                break;
            }
            let captured = self.functions.last().unwrap().locals.last().unwrap().is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.functions.last_mut().unwrap().locals.pop();
        }
    }

    // ---- names: locals/upvalues/globals -------------------------------

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.vm.intern(name);
        self.make_constant(Value::String(interned))
    }

    fn identifiers_equal(a: &str, b: &str) -> bool {
        a == b
    }

    fn resolve_local(&mut self, func_index: usize, name: &str) -> Option<u8> {
        let locals = &self.functions[func_index].locals;
        for i in (0..locals.len()).rev() {
            if Self::identifiers_equal(name, locals[i].name) {
                if locals[i].depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u8> {
        if func_index == 0 {
            return None;
        }
        let enclosing = func_index - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(func_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(func_index, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool) -> u8 {
        let func = &mut self.functions[func_index];
        for (i, existing) in func.upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return i as u8;
            }
        }
        if func.upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        func.upvalues.push(UpvalueDescriptor { is_local, index });
        (func.upvalues.len() - 1) as u8
    }

    fn add_local(&mut self, name: &'src str) {
        let func = self.functions.last_mut().unwrap();
        if func.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        func.locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        let func = self.functions.last().unwrap();
        if func.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let scope_depth = func.scope_depth;
        for local in func.locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if Self::identifiers_equal(name, local.name) {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.functions.last().unwrap().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let func = self.functions.last_mut().unwrap();
        if func.scope_depth == 0 {
            return;
        }
        let depth = func.scope_depth;
        func.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.functions.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal, global);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    // ---- imports --------------------------------------------------------

    fn import_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect a file to import.");
        let name = self.previous.lexeme.to_string();
        self.vm.run_import(&name);
        // No terminator is consumed here: the parser resumes at whatever
        // token follows the imported identifier.
    }

    // ---- expressions ------------------------------------------------

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Self::get_rule(operator);
        self.parse_precedence(rule.precedence.next());

        match operator {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Amp => self.emit_op(OpCode::BitwiseAnd),
            TokenKind::Pipe => self.emit_op(OpCode::BitwiseOr),
            TokenKind::Caret => self.emit_op(OpCode::BitwiseXor),
            TokenKind::LShift => self.emit_op(OpCode::BitwiseLShift),
            TokenKind::RShift => self.emit_op(OpCode::BitwiseRShift),
            _ => unreachable!("not a binary operator token"),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_bytes(OpCode::GetProperty, name);
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let interned = self.vm.intern(text);
        self.emit_constant(Value::String(interned));
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 array elements.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        self.emit_bytes(OpCode::Array, count as u8);
    }

    fn dict_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after key.");
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 dict entries.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after dict elements.");
        self.emit_bytes(OpCode::Dict, count as u8);
    }

    fn object_access(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::ObjectSet);
        } else {
            self.emit_op(OpCode::ObjectGet);
        }
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let func_index = self.functions.len() - 1;
        let (get_op, set_op, arg);
        if let Some(local) = self.resolve_local(func_index, name.lexeme) {
            get_op = OpCode::GetLocal;
            set_op = OpCode::SetLocal;
            arg = local;
        } else if let Some(upvalue) = self.resolve_upvalue(func_index, name.lexeme) {
            get_op = OpCode::GetUpvalue;
            set_op = OpCode::SetUpvalue;
            arg = upvalue;
        } else {
            get_op = OpCode::GetGlobal;
            set_op = OpCode::SetGlobal;
            arg = self.identifier_constant(name.lexeme);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn synthetic_token(text: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Identifier, lexeme: text, line: 0 }
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable(Self::synthetic_token("this"), false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Self::synthetic_token("super"), false);
            self.emit_bytes(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Self::synthetic_token("super"), false);
            self.emit_bytes(OpCode::GetSuper, name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Tilde => self.emit_op(OpCode::BitwiseNot),
            _ => unreachable!(),
        }
    }

    // ---- Pratt table ------------------------------------------------

    fn get_rule(kind: TokenKind) -> ParseRule<'src, 'vm> {
        use Precedence::*;
        use TokenKind::*;
        let (prefix, infix, precedence): (
            Option<PrefixFn<'src, 'vm>>,
            Option<InfixFn<'src, 'vm>>,
            Precedence,
        ) = match kind {
            LeftParen => (Some(Self::grouping), Some(Self::call), Call),
            LeftBrace => (Some(Self::dict_literal), None, None),
            LeftBracket => (Some(Self::array_literal), Some(Self::object_access), Call),
            Dot => (None, Some(Self::dot), Call),
            Minus => (Some(Self::unary), Some(Self::binary), Term),
            Plus => (None, Some(Self::binary), Term),
            Percent => (None, Some(Self::binary), Term),
            Slash => (None, Some(Self::binary), Factor),
            Star => (None, Some(Self::binary), Factor),
            Bang => (Some(Self::unary), None, None),
            BangEqual => (None, Some(Self::binary), Equality),
            EqualEqual => (None, Some(Self::binary), Equality),
            Greater => (None, Some(Self::binary), Comparison),
            GreaterEqual => (None, Some(Self::binary), Comparison),
            Less => (None, Some(Self::binary), Comparison),
            LessEqual => (None, Some(Self::binary), Comparison),
            Identifier => (Some(Self::variable), None, None),
            String => (Some(Self::string), None, None),
            Number => (Some(Self::number), None, None),
            And => (None, Some(Self::and_), Precedence::And),
            False => (Some(Self::literal), None, None),
            Nil => (Some(Self::literal), None, None),
            Or => (None, Some(Self::or_), Precedence::Or),
            Super => (Some(Self::super_), None, None),
            This => (Some(Self::this_), None, None),
            True => (Some(Self::literal), None, None),
            Amp => (None, Some(Self::binary), Bitwise),
            Pipe => (None, Some(Self::binary), Bitwise),
            Caret => (None, Some(Self::binary), Bitwise),
            LShift => (None, Some(Self::binary), Bitwise),
            RShift => (None, Some(Self::binary), Bitwise),
            Tilde => (Some(Self::unary), None, Bitwise),
            _ => (None, None, None),
        };
        ParseRule { prefix, infix, precedence }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = Self::get_rule(self.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::get_rule(self.current.kind).precedence {
            self.advance();
            let infix = Self::get_rule(self.previous.kind).infix;
            if let Some(infix) = infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn parse_return_type(&mut self) -> Option<ReturnType> {
        if !self.matches(TokenKind::At) {
            return None;
        }
        if self.matches(TokenKind::Identifier) {
            return match self.previous.lexeme {
                "void" => Some(ReturnType::Void),
                "int" => Some(ReturnType::Int),
                "float" => Some(ReturnType::Float),
                "str" => Some(ReturnType::Str),
                "bool" => Some(ReturnType::Bool),
                _ => {
                    self.error("Invalid return type.");
                    None
                }
            };
        }
        self.error("Invalid return type.");
        None
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = if kind != FunctionKind::Script { Some(self.vm.intern(self.previous.lexeme)) } else { None };
        self.functions.push(FunctionState::new(kind));
        self.functions.last_mut().unwrap().name = name;
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                {
                    let func = self.functions.last_mut().unwrap();
                    func.arity += 1;
                    if func.arity > 255 {
                        self.error_at_current("Can't have more than 255 parameters.");
                    }
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");

        let return_type = self.parse_return_type();
        self.functions.last_mut().unwrap().return_type = return_type;

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let last_is_return = self.functions.last().unwrap().last_opcode == Some(OpCode::Return);
        if !last_is_return {
            if matches!(return_type, None | Some(ReturnType::Void)) {
                self.emit_return();
            } else {
                self.error("Function must have an explicit return.");
            }
        }

        let (function, upvalues) = self.end_function();
        let function_rc = Rc::new(function);
        let constant = self.make_constant(Value::Function(Rc::clone(&function_rc)));
        self.emit_bytes(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    /// Pops the innermost `FunctionState`, finalizing it into an
    /// `ObjFunction` plus the upvalue descriptors the enclosing compiler
    /// needs to emit after `OP_CLOSURE`.
    fn end_function(&mut self) -> (ObjFunction, Vec<UpvalueDescriptor>) {
        self.emit_return();
        let state = self.functions.pop().unwrap();
        let function = ObjFunction {
            name: state.name.unwrap_or_else(|| Rc::from("")),
            arity: state.arity.min(255) as u8,
            chunk: state.chunk,
            upvalue_count: state.upvalues.len(),
            return_type: state.return_type,
        };
        (function, state.upvalues)
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_text = self.previous.lexeme;
        let constant = self.identifier_constant(name_text);

        let kind = if name_text == "init" { FunctionKind::Initializer } else { FunctionKind::Method };

        self.function(kind);
        self.emit_bytes(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_bytes(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);

            if Self::identifiers_equal(class_name.lexeme, self.previous.lexeme) {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self.classes.last().unwrap().has_superclass;
        if has_superclass {
            self.end_scope();
        }

        self.classes.pop();
    }

    fn fn_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn out_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Out);
    }

    fn return_statement(&mut self) {
        if self.functions.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            if self.functions.last().unwrap().return_type != Some(ReturnType::Void) {
                self.error("Function must return a value.");
            }
            self.emit_return();
            return;
        }

        if self.functions.last().unwrap().return_type == Some(ReturnType::Void) {
            self.error("Void function cannot return a value.");
        }

        if self.functions.last().unwrap().kind == FunctionKind::Initializer {
            self.error("Can't return a value from an initializer.");
        }

        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.");

        let last_opcode = self.functions.last().unwrap().last_opcode;
        let last_constant_is_number =
            matches!(self.current_chunk().constants.last(), Some(Value::Number(_)));
        let last_constant_is_string =
            matches!(self.current_chunk().constants.last(), Some(Value::String(_)));
        match self.functions.last().unwrap().return_type {
            Some(ReturnType::Int) | Some(ReturnType::Float) => {
                let is_constant_load =
                    matches!(last_opcode, Some(OpCode::Constant) | Some(OpCode::ConstantLong));
                let ok = matches!(
                    last_opcode,
                    Some(OpCode::Add)
                        | Some(OpCode::Subtract)
                        | Some(OpCode::Multiply)
                        | Some(OpCode::Divide)
                        | Some(OpCode::Negate)
                ) || (is_constant_load && last_constant_is_number);
                if !ok {
                    self.error("Function must return a number.");
                }
            }
            Some(ReturnType::Str) => {
                let is_constant_load =
                    matches!(last_opcode, Some(OpCode::Constant) | Some(OpCode::ConstantLong));
                if !(is_constant_load && last_constant_is_string) {
                    self.error("Function must return a string.");
                }
            }
            Some(ReturnType::Bool) => {
                let ok = matches!(
                    last_opcode,
                    Some(OpCode::True)
                        | Some(OpCode::False)
                        | Some(OpCode::Equal)
                        | Some(OpCode::Greater)
                        | Some(OpCode::Less)
                        | Some(OpCode::Not)
                );
                if !ok {
                    self.error("Function must return a boolean.");
                }
            }
            Some(ReturnType::Void) | None => {}
        }

        self.emit_op(OpCode::Return);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn until_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'until'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        self.emit_op(OpCode::Not);

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fn
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Out
                | TokenKind::Return
                | TokenKind::Import => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fn) {
            self.fn_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::Import) {
            self.import_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Out) {
            self.out_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::Until) {
            self.until_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn run(&mut self) -> Option<Rc<ObjFunction>> {
        self.advance();
        while !self.matches(TokenKind::Eof) {
            self.declaration();
        }
        let (function, _upvalues) = self.end_function();
        if self.had_error {
            None
        } else {
            Some(Rc::new(function))
        }
    }
}

/// Compiles `source` into a top-level script function, or `None` if any
/// compile error was reported. `vm` supplies the string interner (so
/// literal equality is later pointer equality in the running program) and
/// drives `import` declarations.
pub fn compile(source: &str, vm: &mut Vm) -> Option<Rc<ObjFunction>> {
    let mut compiler = Compiler::new(source, vm);
    compiler.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;

    fn compiled(source: &str) -> Rc<ObjFunction> {
        let mut vm = Vm::new_headless();
        compile(source, &mut vm).expect("expected successful compile")
    }

    #[test]
    fn compiles_arithmetic_with_precedence() {
        let function = compiled("1 + 2 * 3;");
        assert_eq!(function.chunk.code[0], OpCode::Constant as u8);
    }

    #[test]
    fn bitwise_binds_tighter_than_factor() {
        // `2 * 3 & 1` must parse as `2 * (3 & 1)` because BITWISE sits
        // above FACTOR in the precedence ladder.
        let function = compiled("out 2 * 3 & 1;");
        let ops = &function.chunk.code;
        let multiply_index = ops.iter().position(|&b| b == OpCode::Multiply as u8).unwrap();
        let and_index = ops.iter().position(|&b| b == OpCode::BitwiseAnd as u8).unwrap();
        assert!(and_index < multiply_index, "bitwise-and should be compiled before multiply");
    }

    #[test]
    fn missing_explicit_return_in_typed_function_reports_error() {
        let mut vm = Vm::new_headless();
        let result = compile("fn f() @int { var a = 1; }", &mut vm);
        assert!(result.is_none());
    }

    #[test]
    fn greater_equal_lowers_to_less_not() {
        let function = compiled("out 1 >= 2;");
        let ops = &function.chunk.code;
        let less_pos = ops.iter().position(|&b| b == OpCode::Less as u8).unwrap();
        assert_eq!(ops[less_pos + 1], OpCode::Not as u8);
    }
}
