//! Single-pass Pratt compiler
//!
//! Parses Ilex source and emits bytecode directly, with no AST stage.
//! Each token kind has optional prefix/infix handlers plus a precedence;
//! `parse_precedence` drives the ladder and threads the `can_assign`
//! flag into prefix rules so `=` is only honored at assignment level.
//!
//! Compiler state is a stack of per-function compilers (locals, upvalue
//! descriptors, scope depth) plus a parallel class-compiler stack for
//! `this`/`super` resolution. All state lives in the `Compiler` struct;
//! nothing is global, so multiple compilations can run in one process.

use std::collections::HashSet;
use std::rc::Rc;

use ilex_core::{
    AccessLevel, ClassKind, Chunk, CompiledFunction, Constant, FunctionKind, OpCode,
};

use crate::error::CompileError;
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_CONSTANTS: usize = u16::MAX as usize;

/// Names the embedding VM has already bound, threaded into compilation
/// so identifier resolution can split script-level names from true
/// globals, and `use` can route builtin libraries by index.
#[derive(Debug, Clone, Default)]
pub struct CompilerOptions {
    /// Registered global natives/values; unresolved identifiers found
    /// here compile to the `*_GLOBAL` ops.
    pub globals: Vec<String>,
    /// Builtin library names, in registration order.
    pub builtin_libs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Prec {
    None,
    Assign,     // = += -= ...
    Ternary,    // ?:
    NullCo,     // ??
    Or,         // or ||
    And,        // and &&
    Equality,   // == !=
    Comparison, // < > <= >=
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Shift,      // << >>
    Term,       // + - ..
    Factor,     // * / %
    Power,      // **
    Unary,      // ! - ~
    Call,       // . () [] ?.
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assign,
            Prec::Assign => Prec::Ternary,
            Prec::Ternary => Prec::NullCo,
            Prec::NullCo => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::BitOr,
            Prec::BitOr => Prec::BitXor,
            Prec::BitXor => Prec::BitAnd,
            Prec::BitAnd => Prec::Shift,
            Prec::Shift => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Power,
            Prec::Power => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call => Prec::Primary,
            Prec::Primary => Prec::Primary,
        }
    }
}

type ParseFn<'src> = fn(&mut Compiler<'src>, bool);

struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Prec,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
    is_const: bool,
}

struct UpvalueDesc {
    index: u16,
    is_local: bool,
}

enum BreakableKind {
    Loop {
        /// Backward continue target; `None` while the target is still
        /// ahead (do-while conditions), patched via `continue_jumps`.
        start: Option<usize>,
        continue_jumps: Vec<usize>,
    },
    Switch,
}

struct Breakable {
    kind: BreakableKind,
    break_jumps: Vec<usize>,
    scope_depth: i32,
    /// `open_files` length at entry; break/continue close files opened
    /// inside the construct before jumping out.
    file_floor: usize,
}

/// Per-function compilation state.
struct FuncCompiler {
    function: CompiledFunction,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    breakables: Vec<Breakable>,
    /// Stack slots holding `withFile` handles that must be closed on
    /// every exit path of their block.
    open_files: Vec<u16>,
}

impl FuncCompiler {
    fn new(kind: FunctionKind, name: Rc<str>, access: AccessLevel) -> Self {
        let mut function = CompiledFunction::new(kind, name);
        function.access = access;

        // Slot zero holds the called closure, or the receiver for
        // methods where it is addressable as `this`.
        let slot_zero = if matches!(kind, FunctionKind::Function | FunctionKind::Script) {
            ""
        } else {
            "this"
        };

        FuncCompiler {
            function,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                is_captured: false,
                is_const: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            breakables: Vec::new(),
            open_files: Vec::new(),
        }
    }
}

struct ClassContext {
    name: String,
    has_superclass: bool,
    /// Names declared `private var` in this class; `this.<name>` accesses
    /// of these compile to the private property ops.
    private_fields: Vec<String>,
}

pub struct Compiler<'src> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    next: Token<'src>,
    /// Kind of the token before `previous`; used to spot `this.` so
    /// property ops can take the private-access form.
    prev2: TokenKind,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<String>,

    compilers: Vec<FuncCompiler>,
    classes: Vec<ClassContext>,

    /// Script-level names declared so far (routes `*_SCRIPT` ops).
    script_names: HashSet<String>,
    script_consts: HashSet<String>,

    options: CompilerOptions,
}

/// Compile a whole script into its top-level function prototype.
pub fn compile(
    source: &str,
    options: &CompilerOptions,
) -> Result<Rc<CompiledFunction>, CompileError> {
    let mut compiler = Compiler::new(source, options.clone());

    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }

    let function = compiler.end_compiler().0;
    if compiler.had_error {
        Err(CompileError::new(compiler.errors))
    } else {
        Ok(function)
    }
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str, options: CompilerOptions) -> Self {
        let mut lexer = Lexer::new(source);
        let first = lexer.next_token();
        let eof = Token::synthetic(TokenKind::Eof, "");

        Compiler {
            lexer,
            previous: eof,
            current: eof,
            next: first,
            prev2: TokenKind::Eof,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            compilers: vec![FuncCompiler::new(FunctionKind::Script, "".into(), AccessLevel::Public)],
            classes: Vec::new(),
            script_names: HashSet::new(),
            script_consts: HashSet::new(),
            options,
        }
    }

    // =========================================================================
    // Token plumbing
    // =========================================================================

    fn advance(&mut self) {
        self.prev2 = self.previous.kind;
        self.previous = self.current;

        loop {
            self.current = self.next;
            self.next = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn eat(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn lookahead(&self, kind: TokenKind) -> bool {
        self.next.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // =========================================================================
    // Error reporting
    // =========================================================================

    fn error_at(&mut self, at_current: bool, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let token = if at_current { self.current } else { self.previous };
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors
            .push(format!("[line {}] Error{}: {}", token.line, location, message));
    }

    fn error(&mut self, message: &str) {
        self.error_at(false, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(true, message);
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
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Switch
                | TokenKind::Return
                | TokenKind::Use
                | TokenKind::Assert => return,
                _ => {}
            }
            self.advance();
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn fc(&mut self) -> &mut FuncCompiler {
        self.compilers.last_mut().expect("compiler stack is never empty")
    }

    fn fc_ref(&self) -> &FuncCompiler {
        self.compilers.last().expect("compiler stack is never empty")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.fc().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_short(&mut self, value: u16) {
        self.emit_byte((value >> 8) as u8);
        self.emit_byte((value & 0xff) as u8);
    }

    fn emit_op_short(&mut self, op: OpCode, value: u16) {
        self.emit_op(op);
        self.emit_short(value);
    }

    fn make_constant(&mut self, value: Constant) -> u16 {
        let index = self.current_chunk().add_constant(value);
        if index > MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u16
    }

    fn emit_constant(&mut self, value: Constant) {
        let index = self.make_constant(value);
        self.emit_op_short(OpCode::Constant, index);
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        self.make_constant(Constant::String(name.into()))
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
        self.current_chunk().code[offset] = ((jump >> 8) & 0xff) as u8;
        self.current_chunk().code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_short(offset as u16);
    }

    fn emit_return(&mut self) {
        if self.fc_ref().function.kind == FunctionKind::Initializer {
            self.emit_op_short(OpCode::GetLocal, 0); // this
        } else {
            self.emit_op(OpCode::Null);
        }
        self.emit_op(OpCode::Return);
    }

    fn end_compiler(&mut self) -> (Rc<CompiledFunction>, Vec<UpvalueDesc>) {
        self.emit_return();
        let fc = self.compilers.pop().expect("compiler stack is never empty");
        (Rc::new(fc.function), fc.upvalues)
    }

    // =========================================================================
    // Scopes and locals
    // =========================================================================

    fn begin_scope(&mut self) {
        self.fc().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fc().scope_depth -= 1;

        while let Some(local) = self.fc_ref().locals.last() {
            if local.depth <= self.fc_ref().scope_depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.fc().locals.pop();
        }
    }

    /// Emit pops for locals deeper than `depth` without forgetting them;
    /// used when `break`/`continue` jump out of nested scopes.
    fn discard_locals(&mut self, depth: i32) {
        let locals = &self.fc_ref().locals;
        let mut ops = Vec::new();
        for local in locals.iter().rev() {
            if local.depth <= depth {
                break;
            }
            ops.push(local.is_captured);
        }
        for captured in ops {
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &str, is_const: bool) {
        if self.fc_ref().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.fc().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            is_captured: false,
            is_const,
        });
    }

    fn declare_variable(&mut self, name: &str, is_const: bool) {
        if self.fc_ref().scope_depth == 0 {
            return;
        }

        let depth = self.fc_ref().scope_depth;
        let mut duplicate = false;
        for local in self.fc_ref().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name, is_const);
    }

    fn mark_initialized(&mut self) {
        if self.fc_ref().scope_depth == 0 {
            return;
        }
        let depth = self.fc_ref().scope_depth;
        if let Some(local) = self.fc().locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Bind a just-parsed declaration: locals get initialized in place,
    /// script-level names are defined in the script's export table.
    fn define_variable(&mut self, name: &str, is_const: bool) {
        if self.fc_ref().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        let name_const = self.identifier_constant(name);
        self.emit_op_short(OpCode::DefineScript, name_const);
        self.emit_byte(is_const as u8);
        self.script_names.insert(name.to_string());
        if is_const {
            self.script_consts.insert(name.to_string());
        }
    }

    fn resolve_local(&mut self, compiler: usize, name: &str) -> Option<(u16, bool)> {
        let mut uninitialized = false;
        let mut found = None;
        {
            let fc = &self.compilers[compiler];
            for (i, local) in fc.locals.iter().enumerate().rev() {
                if local.name == name {
                    if local.depth == -1 {
                        uninitialized = true;
                    }
                    found = Some((i as u16, local.is_const));
                    break;
                }
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, compiler: usize, index: u16, is_local: bool) -> u16 {
        let fc = &self.compilers[compiler];
        for (i, upvalue) in fc.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u16;
            }
        }

        if fc.upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let fc = &mut self.compilers[compiler];
        fc.upvalues.push(UpvalueDesc { index, is_local });
        fc.function.upvalue_count = fc.upvalues.len() as u16;
        fc.function.upvalue_count - 1
    }

    fn resolve_upvalue(&mut self, compiler: usize, name: &str) -> Option<u16> {
        if compiler == 0 {
            return None;
        }
        let enclosing = compiler - 1;

        if let Some((local, _)) = self.resolve_local(enclosing, name) {
            self.compilers[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(compiler, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(compiler, upvalue, false));
        }

        None
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self) {
        self.parse_precedence(Prec::Assign);
    }

    fn parse_precedence(&mut self, precedence: Prec) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Prec::Assign;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            let infix = Self::rule(self.previous.kind)
                .infix
                .expect("tokens with a precedence always have an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Assign) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src> {
        use TokenKind as TK;

        fn r<'a>(
            prefix: Option<ParseFn<'a>>,
            infix: Option<ParseFn<'a>>,
            precedence: Prec,
        ) -> ParseRule<'a> {
            ParseRule { prefix, infix, precedence }
        }

        match kind {
            TK::LParen => r(Some(Self::grouping), Some(Self::call), Prec::Call),
            TK::LBracket => r(Some(Self::array_literal), Some(Self::subscript), Prec::Call),
            TK::LBrace => r(Some(Self::map_or_set_literal), None, Prec::None),
            TK::Dot => r(None, Some(Self::dot), Prec::Call),
            TK::Opt => r(None, Some(Self::opt_dot), Prec::Call),
            TK::Minus => r(Some(Self::unary), Some(Self::binary), Prec::Term),
            TK::Plus => r(None, Some(Self::binary), Prec::Term),
            TK::DotDot => r(None, Some(Self::binary), Prec::Term),
            TK::Div => r(None, Some(Self::binary), Prec::Factor),
            TK::Mul => r(None, Some(Self::binary), Prec::Factor),
            TK::Mod => r(None, Some(Self::binary), Prec::Factor),
            TK::Pow => r(None, Some(Self::binary), Prec::Power),
            TK::Not => r(Some(Self::unary), None, Prec::None),
            TK::BitNot => r(Some(Self::unary), None, Prec::None),
            TK::NotEq => r(None, Some(Self::binary), Prec::Equality),
            TK::Eq => r(None, Some(Self::binary), Prec::Equality),
            TK::Gr => r(None, Some(Self::binary), Prec::Comparison),
            TK::GrEq => r(None, Some(Self::binary), Prec::Comparison),
            TK::Lt => r(None, Some(Self::binary), Prec::Comparison),
            TK::LtEq => r(None, Some(Self::binary), Prec::Comparison),
            TK::BitAnd => r(None, Some(Self::binary), Prec::BitAnd),
            TK::BitOr => r(None, Some(Self::binary), Prec::BitOr),
            TK::BitXor => r(None, Some(Self::binary), Prec::BitXor),
            TK::BitLs => r(None, Some(Self::binary), Prec::Shift),
            TK::BitRs => r(None, Some(Self::binary), Prec::Shift),
            TK::Inc => r(None, Some(Self::value_inc), Prec::Term),
            TK::Dec => r(None, Some(Self::value_dec), Prec::Term),
            TK::And => r(None, Some(Self::and), Prec::And),
            TK::Or => r(None, Some(Self::binary), Prec::Or),
            TK::NullCoalesce => r(None, Some(Self::binary), Prec::NullCo),
            TK::Ter => r(None, Some(Self::ternary), Prec::Ternary),
            TK::Ident => r(Some(Self::variable), None, Prec::None),
            TK::String => r(Some(Self::string), None, Prec::None),
            TK::Number => r(Some(Self::number), None, Prec::None),
            TK::True | TK::False | TK::Null => r(Some(Self::literal), None, Prec::None),
            TK::This => r(Some(Self::this), None, Prec::None),
            TK::Super => r(Some(Self::super_), None, Prec::None),
            _ => r(None, None, Prec::None),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.eat(TokenKind::RParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let raw: String = self.previous.lexeme.chars().filter(|c| *c != '_').collect();

        let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16).ok().map(|n| n as f64)
        } else if let Some(oct) = raw
            .strip_prefix("0o")
            .or_else(|| raw.strip_prefix("0O"))
            .or_else(|| raw.strip_prefix("0q"))
            .or_else(|| raw.strip_prefix("0Q"))
        {
            i64::from_str_radix(oct, 8).ok().map(|n| n as f64)
        } else {
            raw.parse::<f64>().ok()
        };

        match parsed {
            Some(value) => self.emit_constant(Constant::Number(value)),
            None => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let body = &lexeme[1..lexeme.len() - 1];
        let unescaped = unescape(body);
        self.emit_constant(Constant::String(unescaped.into()));
    }

    fn string_constant_from_previous(&mut self) -> u16 {
        let lexeme = self.previous.lexeme;
        let body = &lexeme[1..lexeme.len() - 1];
        let unescaped = unescape(body);
        self.make_constant(Constant::String(unescaped.into()))
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Null => self.emit_op(OpCode::Null),
            _ => unreachable!(),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Prec::Unary);
        match op {
            TokenKind::Not => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Neg),
            TokenKind::BitNot => self.emit_op(OpCode::BitNot),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        let rule = Self::rule(op);

        // `**` is right-associative; everything else parses the right
        // operand one level up.
        let next = if op == TokenKind::Pow {
            Prec::Power
        } else {
            rule.precedence.next()
        };
        self.parse_precedence(next);

        match op {
            TokenKind::NotEq => self.emit_op(OpCode::NotEq),
            TokenKind::Eq => self.emit_op(OpCode::Eq),
            TokenKind::Gr => self.emit_op(OpCode::Gr),
            TokenKind::GrEq => self.emit_op(OpCode::GrEq),
            TokenKind::Lt => self.emit_op(OpCode::Lt),
            TokenKind::LtEq => self.emit_op(OpCode::LtEq),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::DotDot => self.emit_op(OpCode::Concat),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Mul => self.emit_op(OpCode::Mul),
            TokenKind::Div => self.emit_op(OpCode::Div),
            TokenKind::Mod => self.emit_op(OpCode::Mod),
            TokenKind::Pow => self.emit_op(OpCode::Pow),
            TokenKind::BitAnd => self.emit_op(OpCode::BitAnd),
            TokenKind::BitOr => self.emit_op(OpCode::BitOr),
            TokenKind::BitXor => self.emit_op(OpCode::BitXor),
            TokenKind::BitLs => self.emit_op(OpCode::BitLs),
            TokenKind::BitRs => self.emit_op(OpCode::BitRs),
            TokenKind::Or => self.emit_op(OpCode::Or),
            TokenKind::NullCoalesce => self.emit_op(OpCode::NullCoalesce),
            _ => unreachable!(),
        }
    }

    fn value_inc(&mut self, _can_assign: bool) {
        self.emit_op(OpCode::Inc);
    }

    fn value_dec(&mut self, _can_assign: bool) {
        self.emit_op(OpCode::Dec);
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Prec::And);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self, _can_assign: bool) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Prec::Ternary);
        self.eat(TokenKind::Colon, "Expect ':' in ternary expression.");

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Prec::Ternary);
        self.patch_jump(else_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.eat(TokenKind::RParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        let receiver_is_this = self.prev2 == TokenKind::This && !self.classes.is_empty();

        self.eat(TokenKind::Ident, "Expect property name after '.'.");
        let name_str = self.previous.lexeme.to_string();
        let name = self.identifier_constant(&name_str);

        // `this.x` on a declared private field goes through the
        // private-access forms so methods can reach their own instance's
        // private members; method invocation on `this` resolves private
        // methods at runtime instead.
        let on_this = receiver_is_this
            && self
                .classes
                .last()
                .is_some_and(|c| c.private_fields.contains(&name_str));

        let (get_np, set) = if on_this {
            (OpCode::GetPrivatePropertyNoPop, OpCode::SetPrivateProperty)
        } else {
            (OpCode::GetPropertyNoPop, OpCode::SetProperty)
        };

        if can_assign && self.matches(TokenKind::Assign) {
            self.expression();
            self.emit_op_short(set, name);
        } else if can_assign && self.matches(TokenKind::Inc) {
            self.emit_op_short(get_np, name);
            self.emit_op(OpCode::Inc);
            self.emit_op_short(set, name);
        } else if can_assign && self.matches(TokenKind::Dec) {
            self.emit_op_short(get_np, name);
            self.emit_op(OpCode::Dec);
            self.emit_op_short(set, name);
        } else if can_assign && self.current_compound_op().is_some() {
            let op = self.current_compound_op().expect("checked above");
            self.advance();
            self.emit_op_short(get_np, name);
            self.expression();
            self.emit_op(op);
            self.emit_op_short(set, name);
        } else if self.matches(TokenKind::LParen) {
            let argc = self.argument_list();
            if receiver_is_this {
                self.emit_op_short(OpCode::InvokeThis, name);
            } else {
                self.emit_op_short(OpCode::Invoke, name);
            }
            self.emit_byte(argc);
        } else if on_this {
            self.emit_op_short(OpCode::GetPrivateProperty, name);
        } else {
            self.emit_op_short(OpCode::GetProperty, name);
        }
    }

    /// `a?.b` — skip the access when the receiver is falsy, leaving the
    /// receiver itself (null propagates).
    fn opt_dot(&mut self, _can_assign: bool) {
        self.eat(TokenKind::Ident, "Expect property name after '?.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        let access_jump = self.emit_jump(OpCode::JumpIfTrue);
        let skip_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(access_jump);

        if self.matches(TokenKind::LParen) {
            let argc = self.argument_list();
            self.emit_op_short(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_op_short(OpCode::GetProperty, name);
        }
        self.patch_jump(skip_jump);
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 elements in an array literal.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.eat(TokenKind::RBracket, "Expect ']' after array literal.");
        self.emit_op(OpCode::NewArray);
        self.emit_byte(count.min(255) as u8);
    }

    // `{}` and `{k: v, ...}` are maps, `{v, ...}` is a set.
    fn map_or_set_literal(&mut self, _can_assign: bool) {
        if self.matches(TokenKind::RBrace) {
            self.emit_op(OpCode::NewMap);
            self.emit_byte(0);
            return;
        }

        self.expression();
        if self.matches(TokenKind::Colon) {
            self.expression();
            let mut count: u32 = 1;
            while self.matches(TokenKind::Comma) {
                if self.check(TokenKind::RBrace) {
                    break;
                }
                self.expression();
                self.eat(TokenKind::Colon, "Expect ':' between map key and value.");
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 entries in a map literal.");
                }
                count += 1;
            }
            self.eat(TokenKind::RBrace, "Expect '}' after map literal.");
            self.emit_op(OpCode::NewMap);
            self.emit_byte(count.min(255) as u8);
        } else {
            let mut count: u32 = 1;
            while self.matches(TokenKind::Comma) {
                if self.check(TokenKind::RBrace) {
                    break;
                }
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 elements in a set literal.");
                }
                count += 1;
            }
            self.eat(TokenKind::RBrace, "Expect '}' after set literal.");
            self.emit_op(OpCode::NewSet);
            self.emit_byte(count.min(255) as u8);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        // Open start bound: a[:j] or a[:].
        if self.matches(TokenKind::Colon) {
            self.emit_op(OpCode::Empty);
            if self.check(TokenKind::RBracket) {
                self.emit_op(OpCode::Empty);
            } else {
                self.expression();
            }
            self.eat(TokenKind::RBracket, "Expect ']' after slice.");
            self.emit_op(OpCode::Slice);
            return;
        }

        self.expression();

        if self.matches(TokenKind::Colon) {
            if self.check(TokenKind::RBracket) {
                self.emit_op(OpCode::Empty);
            } else {
                self.expression();
            }
            self.eat(TokenKind::RBracket, "Expect ']' after slice.");
            self.emit_op(OpCode::Slice);
            return;
        }

        self.eat(TokenKind::RBracket, "Expect ']' after index.");

        if can_assign && self.matches(TokenKind::Assign) {
            self.expression();
            self.emit_op(OpCode::IndexAssign);
        } else if can_assign && self.matches(TokenKind::Inc) {
            self.emit_constant(Constant::Number(1.0));
            self.emit_op(OpCode::IndexPush);
            self.emit_op(OpCode::Add);
            self.emit_op(OpCode::IndexAssign);
        } else if can_assign && self.matches(TokenKind::Dec) {
            self.emit_constant(Constant::Number(1.0));
            self.emit_op(OpCode::IndexPush);
            self.emit_op(OpCode::Sub);
            self.emit_op(OpCode::IndexAssign);
        } else if can_assign && self.current_compound_op().is_some() {
            let op = self.current_compound_op().expect("checked above");
            self.advance();
            self.expression();
            self.emit_op(OpCode::IndexPush);
            self.emit_op(op);
            self.emit_op(OpCode::IndexAssign);
        } else {
            self.emit_op(OpCode::Index);
        }
    }

    fn current_compound_op(&self) -> Option<OpCode> {
        match self.current.kind {
            TokenKind::PlusEq => Some(OpCode::Add),
            TokenKind::MinusEq => Some(OpCode::Sub),
            TokenKind::MulEq => Some(OpCode::Mul),
            TokenKind::DivEq => Some(OpCode::Div),
            TokenKind::PowEq => Some(OpCode::Pow),
            TokenKind::ModEq => Some(OpCode::Mod),
            TokenKind::BitAndEq => Some(OpCode::BitAnd),
            TokenKind::BitOrEq => Some(OpCode::BitOr),
            TokenKind::BitXorEq => Some(OpCode::BitXor),
            TokenKind::NullCoalesceEq => Some(OpCode::NullCoalesce),
            _ => None,
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.compilers.len() - 1;

        let (get_op, set_op, arg, is_const) =
            if let Some((slot, is_const)) = self.resolve_local(top, name) {
                (OpCode::GetLocal, OpCode::SetLocal, slot, is_const)
            } else if let Some(slot) = self.resolve_upvalue(top, name) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, slot, false)
            } else if !self.script_names.contains(name)
                && self.options.globals.iter().any(|g| g == name)
            {
                let constant = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, constant, false)
            } else {
                // Script-level name: declared here, or unknown and bound
                // late so forward references from function bodies work.
                let constant = self.identifier_constant(name);
                (OpCode::GetScript, OpCode::SetScript, constant, false)
            };

        let assigning = self.check(TokenKind::Assign)
            || self.check(TokenKind::Inc)
            || self.check(TokenKind::Dec)
            || self.current_compound_op().is_some();
        if can_assign && assigning && is_const {
            self.error(&format!("Cannot assign to const variable '{name}'."));
        }

        if can_assign && self.matches(TokenKind::Assign) {
            self.expression();
            self.emit_op_short(set_op, arg);
        } else if can_assign && self.matches(TokenKind::Inc) {
            self.emit_op_short(get_op, arg);
            self.emit_op(OpCode::Inc);
            self.emit_op_short(set_op, arg);
        } else if can_assign && self.matches(TokenKind::Dec) {
            self.emit_op_short(get_op, arg);
            self.emit_op(OpCode::Dec);
            self.emit_op_short(set_op, arg);
        } else if can_assign && self.current_compound_op().is_some() {
            let op = self.current_compound_op().expect("checked above");
            self.advance();
            self.emit_op_short(get_op, arg);
            self.expression();
            self.emit_op(op);
            self.emit_op_short(set_op, arg);
        } else {
            self.emit_op_short(get_op, arg);
        }
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            _ => {}
        }

        self.eat(TokenKind::Dot, "Expect '.' after 'super'.");
        self.eat(TokenKind::Ident, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.matches(TokenKind::LParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_short(OpCode::InvokeSuper, name);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op_short(OpCode::GetSuper, name);
        }
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    fn declaration(&mut self) {
        if self.check(TokenKind::Abstract) && self.lookahead(TokenKind::Class) {
            self.advance();
            self.advance();
            self.class_declaration(ClassKind::Abstract);
        } else if self.check(TokenKind::Static) && self.lookahead(TokenKind::Class) {
            self.advance();
            self.advance();
            self.class_declaration(ClassKind::Static);
        } else if self.matches(TokenKind::Class) {
            self.class_declaration(ClassKind::Default);
        } else if self.matches(TokenKind::Fn) {
            self.fn_declaration();
        } else if self.matches(TokenKind::Enum) {
            self.enum_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenKind::Const) {
            self.var_declaration(true);
        } else if self.check(TokenKind::Ident) && self.lookahead(TokenKind::VarDecl) {
            self.infer_declaration(false);
        } else if self.check(TokenKind::Ident) && self.lookahead(TokenKind::ConstDecl) {
            self.infer_declaration(true);
        } else if self.matches(TokenKind::Use) {
            self.use_statement();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, is_const: bool) {
        self.eat(TokenKind::Ident, "Expect variable name.");
        let name = self.previous.lexeme.to_string();
        self.declare_variable(&name, is_const);

        if self.matches(TokenKind::Assign) {
            self.expression();
        } else {
            if is_const {
                self.error("Const variable must be initialized.");
            }
            self.emit_op(OpCode::Null);
        }
        self.eat(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(&name, is_const);
    }

    // `x := e;` and `x ::= e;`
    fn infer_declaration(&mut self, is_const: bool) {
        self.eat(TokenKind::Ident, "Expect variable name.");
        let name = self.previous.lexeme.to_string();
        self.declare_variable(&name, is_const);

        self.advance(); // := or ::=
        self.expression();
        self.eat(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(&name, is_const);
    }

    fn fn_declaration(&mut self) {
        self.eat(TokenKind::Ident, "Expect function name.");
        let name = self.previous.lexeme.to_string();
        self.declare_variable(&name, false);
        self.mark_initialized();
        self.function(FunctionKind::Function, name.as_str().into(), AccessLevel::Public);
        self.define_variable(&name, false);
    }

    fn function(&mut self, kind: FunctionKind, name: Rc<str>, access: AccessLevel) {
        self.compilers.push(FuncCompiler::new(kind, name, access));
        self.begin_scope();

        self.eat(TokenKind::LParen, "Expect '(' after function name.");
        let mut seen_default = false;
        if !self.check(TokenKind::RParen) {
            loop {
                if self.fc_ref().function.arity as usize
                    + self.fc_ref().function.arity_default as usize
                    == 255
                {
                    self.error_at_current("Can't have more than 255 parameters.");
                }

                self.eat(TokenKind::Ident, "Expect parameter name.");
                let param = self.previous.lexeme.to_string();
                self.declare_variable(&param, false);
                self.mark_initialized();

                if self.matches(TokenKind::Assign) {
                    // Default values are evaluated in the callee prologue;
                    // OP_DEFINE_DEFAULT keeps the supplied arguments and
                    // drops the rest.
                    seen_default = true;
                    self.fc().function.arity_default += 1;
                    self.expression();
                } else {
                    if seen_default {
                        self.error("Non-default parameter follows a default parameter.");
                    }
                    self.fc().function.arity += 1;
                }

                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.eat(TokenKind::RParen, "Expect ')' after parameters.");

        if self.fc_ref().function.arity_default > 0 {
            let arity = self.fc_ref().function.arity;
            let arity_default = self.fc_ref().function.arity_default;
            self.emit_op(OpCode::DefineDefault);
            self.emit_byte(arity);
            self.emit_byte(arity_default);
        }

        if kind == FunctionKind::Abstract {
            self.eat(TokenKind::Semicolon, "Expect ';' after abstract method signature.");
        } else {
            self.eat(TokenKind::LBrace, "Expect '{' before function body.");
            self.block();
        }

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Constant::Function(function));
        self.emit_op_short(OpCode::Closure, constant);
        for upvalue in &upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_short(upvalue.index);
        }
    }

    fn enum_declaration(&mut self) {
        self.eat(TokenKind::Ident, "Expect enum name.");
        let name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&name);
        self.declare_variable(&name, false);

        self.emit_op_short(OpCode::Enum, name_const);
        if self.fc_ref().scope_depth > 0 {
            // The enum value itself is the local's slot.
            self.mark_initialized();
        }

        self.eat(TokenKind::LBrace, "Expect '{' after enum name.");
        let mut index = 0.0;
        if !self.check(TokenKind::RBrace) {
            loop {
                self.eat(TokenKind::Ident, "Expect enum member name.");
                let member = self.identifier_constant(self.previous.lexeme);

                if self.matches(TokenKind::Assign) {
                    self.expression();
                } else {
                    self.emit_constant(Constant::Number(index));
                }
                self.emit_op_short(OpCode::EnumSetValue, member);
                index += 1.0;

                if !self.matches(TokenKind::Comma) {
                    break;
                }
                if self.check(TokenKind::RBrace) {
                    break;
                }
            }
        }
        self.eat(TokenKind::RBrace, "Expect '}' after enum members.");

        if self.fc_ref().scope_depth == 0 {
            let const_idx = self.identifier_constant(&name);
            self.emit_op_short(OpCode::DefineScript, const_idx);
            self.emit_byte(0);
            self.script_names.insert(name);
        }
    }

    fn class_declaration(&mut self, kind: ClassKind) {
        self.eat(TokenKind::Ident, "Expect class name.");
        let name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&name);
        let is_local = self.fc_ref().scope_depth > 0;

        self.classes.push(ClassContext {
            name: name.clone(),
            has_superclass: false,
            private_fields: Vec::new(),
        });

        if self.matches(TokenKind::Inherits) {
            self.eat(TokenKind::Ident, "Expect superclass name.");
            let super_name = self.previous.lexeme.to_string();
            if super_name == name {
                self.error("A class can't inherit from itself.");
            }

            let mut class_slot = 0u16;
            if is_local {
                // Reserve the class's slot below the superclass scope;
                // the finished class is stored into it at the end.
                self.emit_op(OpCode::Null);
                self.declare_variable(&name, false);
                self.mark_initialized();
                class_slot = (self.fc_ref().locals.len() - 1) as u16;
            }

            self.begin_scope();
            self.named_variable(&super_name, false);
            self.add_local("super", false);
            self.mark_initialized();
            self.classes.last_mut().expect("just pushed").has_superclass = true;

            self.emit_op(OpCode::Inherit);
            self.emit_byte(kind as u8);
            self.emit_short(name_const);

            if !is_local {
                self.emit_op_short(OpCode::DefineScript, name_const);
                self.emit_byte(0);
                self.script_names.insert(name.clone());
                self.named_variable(&name, false);
            }

            self.class_body(kind);
            if kind != ClassKind::Abstract {
                self.emit_op(OpCode::CheckAbstract);
            }

            if is_local {
                self.emit_op_short(OpCode::SetLocal, class_slot);
            }
            self.emit_op(OpCode::Pop);
            self.end_scope();
        } else {
            self.emit_op(OpCode::Class);
            self.emit_byte(kind as u8);
            self.emit_short(name_const);

            if is_local {
                self.declare_variable(&name, false);
                self.mark_initialized();
            } else {
                self.emit_op_short(OpCode::DefineScript, name_const);
                self.emit_byte(0);
                self.script_names.insert(name.clone());
            }
            self.named_variable(&name, false);

            self.class_body(kind);
            self.emit_op(OpCode::Pop);
        }

        self.classes.pop();
    }

    fn class_body(&mut self, class_kind: ClassKind) {
        self.eat(TokenKind::LBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.class_member(class_kind);
        }
        self.eat(TokenKind::RBrace, "Expect '}' after class body.");
    }

    fn class_member(&mut self, class_kind: ClassKind) {
        let mut access = AccessLevel::Public;
        let mut is_static = false;
        let mut is_abstract = false;

        loop {
            if self.matches(TokenKind::Private) {
                access = AccessLevel::Private;
            } else if self.matches(TokenKind::Public) {
                access = AccessLevel::Public;
            } else if self.matches(TokenKind::Static) {
                is_static = true;
            } else if self.matches(TokenKind::Abstract) {
                is_abstract = true;
            } else {
                break;
            }
        }

        if is_abstract && class_kind != ClassKind::Abstract {
            self.error("Abstract methods are only allowed in abstract classes.");
        }

        if self.matches(TokenKind::Var) {
            // Field initializer, evaluated once at class-declaration time.
            self.eat(TokenKind::Ident, "Expect field name.");
            let field_name = self.previous.lexeme.to_string();
            let name = self.identifier_constant(&field_name);
            if access == AccessLevel::Private && !is_static {
                self.classes
                    .last_mut()
                    .expect("inside a class")
                    .private_fields
                    .push(field_name);
            }
            if self.matches(TokenKind::Assign) {
                self.expression();
            } else {
                self.emit_op(OpCode::Null);
            }
            self.eat(TokenKind::Semicolon, "Expect ';' after field declaration.");

            if is_static {
                self.emit_op_short(OpCode::SetClassStaticVar, name);
                self.emit_byte(0);
            } else if access == AccessLevel::Private {
                self.emit_op_short(OpCode::SetPrivateProperty, name);
            } else {
                self.emit_op_short(OpCode::SetProperty, name);
            }
            return;
        }

        if self.matches(TokenKind::Const) {
            self.eat(TokenKind::Ident, "Expect constant name.");
            let name = self.identifier_constant(self.previous.lexeme);
            self.eat(TokenKind::Assign, "Expect '=' after class constant name.");
            self.expression();
            self.eat(TokenKind::Semicolon, "Expect ';' after class constant.");
            self.emit_op_short(OpCode::SetClassStaticVar, name);
            self.emit_byte(1);
            return;
        }

        // Method (or initializer).
        self.eat(TokenKind::Ident, "Expect method name.");
        let method_name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&method_name);

        let kind = if method_name == "init" {
            FunctionKind::Initializer
        } else if is_abstract {
            FunctionKind::Abstract
        } else if is_static {
            FunctionKind::Static
        } else {
            FunctionKind::Method
        };

        let class_name = self.classes.last().expect("inside a class").name.clone();
        let qualified: Rc<str> = format!("{class_name}.{method_name}").into();
        self.function(kind, qualified, access);
        self.emit_op_short(OpCode::Method, name_const);
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self) {
        if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::Do) {
            self.do_while_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(TokenKind::Assert) {
            self.assert_statement();
        } else if self.matches(TokenKind::Panic) {
            self.panic_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::WithFile) {
            self.with_file_statement();
        } else if self.matches(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.eat(TokenKind::RBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.eat(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.eat(TokenKind::LParen, "Expect '(' after 'if'.");
        self.expression();
        self.eat(TokenKind::RParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.eat(TokenKind::LBrace, "Expect '{' after ')'.");
        self.begin_scope();
        self.block();
        self.end_scope();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Elif) {
            self.if_statement();
        } else if self.matches(TokenKind::Else) {
            if self.matches(TokenKind::If) {
                self.if_statement();
            } else {
                self.eat(TokenKind::LBrace, "Expect '{' after 'else'.");
                self.begin_scope();
                self.block();
                self.end_scope();
            }
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.eat(TokenKind::LParen, "Expect '(' after 'while'.");
        self.expression();
        self.eat(TokenKind::RParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.push_breakable(BreakableKind::Loop {
            start: Some(loop_start),
            continue_jumps: Vec::new(),
        });

        self.eat(TokenKind::LBrace, "Expect '{' after ')'.");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        self.pop_breakable();
    }

    fn do_while_statement(&mut self) {
        let body_start = self.current_chunk().code.len();

        self.push_breakable(BreakableKind::Loop {
            start: None,
            continue_jumps: Vec::new(),
        });

        self.eat(TokenKind::LBrace, "Expect '{' after 'do'.");
        self.begin_scope();
        self.block();
        self.end_scope();

        // Continue targets the condition, which sits after the body.
        let continue_jumps = match &mut self.fc().breakables.last_mut().expect("pushed above").kind
        {
            BreakableKind::Loop { continue_jumps, .. } => std::mem::take(continue_jumps),
            BreakableKind::Switch => unreachable!(),
        };
        for jump in continue_jumps {
            self.patch_jump(jump);
        }

        self.eat(TokenKind::While, "Expect 'while' after do block.");
        self.eat(TokenKind::LParen, "Expect '(' after 'while'.");
        self.expression();
        self.eat(TokenKind::RParen, "Expect ')' after condition.");
        self.eat(TokenKind::Semicolon, "Expect ';' after do-while condition.");

        self.emit_op(OpCode::JumpDoWhile);
        let offset = self.current_chunk().code.len() - body_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_short(offset as u16);

        self.pop_breakable();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.eat(TokenKind::LParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.check(TokenKind::Ident) && self.lookahead(TokenKind::VarDecl) {
            self.infer_declaration(false);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.eat(TokenKind::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.eat(TokenKind::RParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.push_breakable(BreakableKind::Loop {
            start: Some(loop_start),
            continue_jumps: Vec::new(),
        });

        self.eat(TokenKind::LBrace, "Expect '{' after ')'.");
        self.begin_scope();
        self.block();
        self.end_scope();

        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.pop_breakable();
        self.end_scope();
    }

    fn switch_statement(&mut self) {
        self.eat(TokenKind::LParen, "Expect '(' after 'switch'.");
        self.expression();
        self.eat(TokenKind::RParen, "Expect ')' after switch value.");
        self.eat(TokenKind::LBrace, "Expect '{' after ')'.");

        self.push_breakable(BreakableKind::Switch);

        // (comparison opcode offset, jump operand offset) of the pending case.
        let mut prev_case: Option<(usize, usize)> = None;

        while self.matches(TokenKind::Case) {
            if let Some((_, operand)) = prev_case {
                self.patch_jump(operand);
            }

            let mut values: u32 = 1;
            self.expression();
            while self.matches(TokenKind::Comma) {
                self.expression();
                if values == 255 {
                    self.error("Too many values in one case.");
                }
                values += 1;
            }
            if values > 1 {
                self.emit_op(OpCode::MultiCase);
                self.emit_byte((values - 1).min(255) as u8);
            }
            self.eat(TokenKind::Colon, "Expect ':' after case value.");

            let op_offset = self.current_chunk().code.len();
            let operand = self.emit_jump(OpCode::CmpJmp);

            // Cases don't fall through by default. A trailing `continue;`
            // marks explicit fall-through: the body then flows into the
            // next comparison, and this case's opcode is rewritten to the
            // flag-setting form so the next case admits it unconditionally.
            let mut falls_through = false;
            while !self.check(TokenKind::Case)
                && !self.check(TokenKind::Default)
                && !self.check(TokenKind::RBrace)
                && !self.check(TokenKind::Eof)
            {
                if self.check(TokenKind::Continue) && self.lookahead(TokenKind::Semicolon) {
                    self.advance();
                    self.advance();
                    falls_through = true;
                    if !self.check(TokenKind::Case)
                        && !self.check(TokenKind::Default)
                        && !self.check(TokenKind::RBrace)
                    {
                        self.error("'continue' must end its case.");
                    }
                    break;
                }
                self.statement();
            }

            if falls_through {
                self.current_chunk().code[op_offset] = OpCode::CmpJmpFall as u8;
            } else {
                // Implicit exit once the body completes.
                let end_jump = self.emit_jump(OpCode::Jump);
                let top = self.fc_ref().breakables.len() - 1;
                self.fc().breakables[top].break_jumps.push(end_jump);
            }
            prev_case = Some((op_offset, operand));
        }

        // The no-match chain still carries the switch value; bodies that
        // fall off the final case must skip that pop.
        if let Some((_, operand)) = prev_case {
            let skip = self.emit_jump(OpCode::Jump);
            self.patch_jump(operand);
            self.emit_op(OpCode::Pop);
            self.patch_jump(skip);
        } else {
            self.emit_op(OpCode::Pop);
        }

        if self.matches(TokenKind::Default) {
            self.eat(TokenKind::Colon, "Expect ':' after 'default'.");
            while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
                self.statement();
            }
        }

        self.eat(TokenKind::RBrace, "Expect '}' after switch body.");
        self.pop_breakable();
    }

    fn assert_statement(&mut self) {
        self.eat(TokenKind::LParen, "Expect '(' after 'assert'.");
        let mut message = self.make_constant(Constant::String("".into()));

        self.expression();

        if self.matches(TokenKind::Comma) {
            self.eat(TokenKind::String, "Expect assert message string after ','.");
            message = self.string_constant_from_previous();
        }
        self.eat(TokenKind::RParen, "Expect ')' after condition.");
        self.eat(TokenKind::Semicolon, "Expect ';' after ')'.");

        self.emit_op_short(OpCode::Assert, message);
    }

    fn panic_statement(&mut self) {
        self.eat(TokenKind::LParen, "Expect '(' after 'panic!'.");
        self.eat(TokenKind::String, "Expect panic message string.");
        let message = self.string_constant_from_previous();
        self.eat(TokenKind::RParen, "Expect ')' after panic message.");
        self.eat(TokenKind::Semicolon, "Expect ';' after ')'.");

        self.emit_op_short(OpCode::Panic, message);
    }

    fn return_statement(&mut self) {
        if self.fc_ref().function.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.close_open_files_for_return();
            self.emit_return();
        } else {
            if self.fc_ref().function.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.eat(TokenKind::Semicolon, "Expect ';' after return value.");
            self.close_open_files_for_return();
            self.emit_op(OpCode::Return);
        }
    }

    fn with_file_statement(&mut self) {
        self.eat(TokenKind::LParen, "Expect '(' after 'withFile'.");
        self.expression();
        self.eat(TokenKind::Comma, "Expect ',' between file path and mode.");
        self.expression();
        self.eat(TokenKind::RParen, "Expect ')' after file mode.");
        self.eat(TokenKind::As, "Expect 'as' after withFile(...).");
        self.eat(TokenKind::Ident, "Expect a name for the file binding.");
        let name = self.previous.lexeme.to_string();

        self.begin_scope();
        self.emit_op(OpCode::OpenFile);
        self.declare_variable(&name, false);
        self.mark_initialized();
        let slot = (self.fc_ref().locals.len() - 1) as u16;
        self.fc().open_files.push(slot);

        self.eat(TokenKind::LBrace, "Expect '{' after file binding.");
        self.block();

        self.emit_op_short(OpCode::CloseFile, slot);
        self.fc().open_files.pop();
        self.end_scope();
    }

    fn close_open_files_for_return(&mut self) {
        let slots = self.fc_ref().open_files.clone();
        for slot in slots.iter().rev() {
            self.emit_op_short(OpCode::CloseFile, *slot);
        }
    }

    // =========================================================================
    // Break / continue
    // =========================================================================

    fn push_breakable(&mut self, kind: BreakableKind) {
        let scope_depth = self.fc_ref().scope_depth;
        let file_floor = self.fc_ref().open_files.len();
        self.fc().breakables.push(Breakable {
            kind,
            break_jumps: Vec::new(),
            scope_depth,
            file_floor,
        });
    }

    fn pop_breakable(&mut self) {
        let breakable = self.fc().breakables.pop().expect("matched push");
        for jump in breakable.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        self.eat(TokenKind::Semicolon, "Expect ';' after 'break'.");
        self.break_out();
    }

    /// Shared body of `break;` once the tokens are consumed.
    fn break_out(&mut self) {
        if self.fc_ref().breakables.is_empty() {
            self.error("Can't use 'break' outside of a loop or switch.");
            return;
        }

        let target = self.fc_ref().breakables.len() - 1;
        let depth = self.fc_ref().breakables[target].scope_depth;
        let file_floor = self.fc_ref().breakables[target].file_floor;

        self.close_files_down_to(file_floor);
        self.discard_locals(depth);
        self.emit_op(OpCode::Break);
        let jump = self.emit_jump(OpCode::Jump);
        self.fc().breakables[target].break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.eat(TokenKind::Semicolon, "Expect ';' after 'continue'.");

        let Some(target) = self
            .fc_ref()
            .breakables
            .iter()
            .rposition(|b| matches!(b.kind, BreakableKind::Loop { .. }))
        else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };

        let depth = self.fc_ref().breakables[target].scope_depth;
        let file_floor = self.fc_ref().breakables[target].file_floor;
        self.close_files_down_to(file_floor);
        self.discard_locals(depth);

        let start = match &self.fc_ref().breakables[target].kind {
            BreakableKind::Loop { start, .. } => *start,
            BreakableKind::Switch => unreachable!(),
        };
        match start {
            Some(start) => self.emit_loop(start),
            None => {
                let jump = self.emit_jump(OpCode::Jump);
                match &mut self.fc().breakables[target].kind {
                    BreakableKind::Loop { continue_jumps, .. } => continue_jumps.push(jump),
                    BreakableKind::Switch => unreachable!(),
                }
            }
        }
    }

    fn close_files_down_to(&mut self, floor: usize) {
        let slots: Vec<u16> = self.fc_ref().open_files[floor..].to_vec();
        for slot in slots.iter().rev() {
            self.emit_op_short(OpCode::CloseFile, *slot);
        }
    }

    // =========================================================================
    // use
    // =========================================================================

    fn use_statement(&mut self) {
        if self.matches(TokenKind::LBrace) {
            self.use_from_statement();
            return;
        }

        self.eat(TokenKind::String, "Expect import path string after 'use'.");
        let path = raw_string_body(self.previous.lexeme);

        let binding = if self.matches(TokenKind::As) {
            self.eat(TokenKind::Ident, "Expect binding name after 'as'.");
            self.previous.lexeme.to_string()
        } else {
            match import_stem(&path) {
                Some(stem) => stem,
                None => {
                    self.error("Cannot infer a variable name from the import path; use 'as'.");
                    return;
                }
            }
        };
        self.eat(TokenKind::Semicolon, "Expect ';' after use statement.");

        let is_local = self.fc_ref().scope_depth > 0;
        if is_local {
            self.declare_variable(&binding, false);
        }

        if let Some(index) = self.builtin_index(&path) {
            let name_const = self.make_constant(Constant::String(path.as_str().into()));
            self.emit_op(OpCode::UseBuiltin);
            self.emit_byte(index);
            self.emit_short(name_const);
        } else {
            let path_const = self.make_constant(Constant::String(path.as_str().into()));
            self.emit_op_short(OpCode::Use, path_const);
            self.emit_op(OpCode::Pop);
            self.emit_op(OpCode::UseVar);
        }

        if is_local {
            self.mark_initialized();
        } else {
            let name_const = self.identifier_constant(&binding);
            self.emit_op_short(OpCode::DefineScript, name_const);
            self.emit_byte(0);
            self.script_names.insert(binding);
        }
        self.emit_op(OpCode::UseEnd);
    }

    // `use { a, b } from "path";`
    fn use_from_statement(&mut self) {
        let mut names = Vec::new();
        loop {
            self.eat(TokenKind::Ident, "Expect imported name.");
            names.push(self.previous.lexeme.to_string());
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.eat(TokenKind::RBrace, "Expect '}' after imported names.");
        self.eat(TokenKind::From, "Expect 'from' after imported names.");
        self.eat(TokenKind::String, "Expect import path string.");
        let path = raw_string_body(self.previous.lexeme);
        self.eat(TokenKind::Semicolon, "Expect ';' after use statement.");

        let is_local = self.fc_ref().scope_depth > 0;

        if let Some(index) = self.builtin_index(&path) {
            let name_const = self.make_constant(Constant::String(path.as_str().into()));
            self.emit_op(OpCode::UseBuiltin);
            self.emit_byte(index);
            self.emit_short(name_const);
            self.emit_op(OpCode::Pop);

            self.emit_op_short(OpCode::UseBuiltinVar, name_const);
            self.emit_byte(names.len().min(255) as u8);
            let name_consts: Vec<u16> = names
                .iter()
                .map(|n| self.identifier_constant(n))
                .collect();
            for (name, constant) in names.iter().zip(&name_consts) {
                self.emit_short(*constant);
                if is_local {
                    self.declare_variable(name, false);
                    self.mark_initialized();
                }
            }
            if !is_local {
                for (name, constant) in names.iter().zip(&name_consts).rev() {
                    self.emit_op_short(OpCode::DefineScript, *constant);
                    self.emit_byte(0);
                    self.script_names.insert(name.clone());
                }
            }
        } else {
            let path_const = self.make_constant(Constant::String(path.as_str().into()));
            self.emit_op_short(OpCode::Use, path_const);
            self.emit_op(OpCode::Pop);

            if is_local {
                for name in &names {
                    let constant = self.identifier_constant(name);
                    self.emit_op(OpCode::UseVar);
                    self.emit_op_short(OpCode::GetProperty, constant);
                    self.declare_variable(name, false);
                    self.mark_initialized();
                }
            } else {
                let name_consts: Vec<u16> = names
                    .iter()
                    .map(|n| self.identifier_constant(n))
                    .collect();
                for constant in &name_consts {
                    self.emit_op(OpCode::UseVar);
                    self.emit_op_short(OpCode::GetProperty, *constant);
                }
                for (name, constant) in names.iter().zip(&name_consts).rev() {
                    self.emit_op_short(OpCode::DefineScript, *constant);
                    self.emit_byte(0);
                    self.script_names.insert(name.clone());
                }
            }
        }
        self.emit_op(OpCode::UseEnd);
    }

    fn builtin_index(&self, path: &str) -> Option<u8> {
        self.options
            .builtin_libs
            .iter()
            .position(|lib| lib == path)
            .map(|i| i as u8)
    }
}

/// Strip quotes without unescaping; import paths are used verbatim.
fn raw_string_body(lexeme: &str) -> String {
    lexeme[1..lexeme.len() - 1].to_string()
}

/// Variable name implied by an import path: last path segment, `.ilex`
/// stripped. `None` when the stem is not a valid identifier.
fn import_stem(path: &str) -> Option<String> {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = file.strip_suffix(".ilex").unwrap_or(file);

    let mut chars = stem.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_' || first == '$') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(stem.to_string())
}

fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> Rc<CompiledFunction> {
        compile(source, &CompilerOptions::default()).expect("program should compile")
    }

    fn compile_err(source: &str) -> CompileError {
        compile(source, &CompilerOptions::default()).expect_err("program should not compile")
    }

    #[test]
    fn empty_script_compiles_to_implicit_return() {
        let f = compile_ok("");
        assert_eq!(
            f.chunk.code,
            vec![OpCode::Null as u8, OpCode::Return as u8]
        );
    }

    #[test]
    fn compiling_twice_yields_identical_chunks() {
        let source = r#"
            var total = 0;
            fn add(a, b = 2) { return a + b; }
            for (var i = 0; i < 10; i = i + 1) { total = add(total); }
            switch (total) { case 1: total = 2; break; default: total = 3; }
        "#;
        let a = compile_ok(source);
        let b = compile_ok(source);
        assert_eq!(a, b);
    }

    #[test]
    fn locals_resolve_before_script_names() {
        let f = compile_ok("var x = 1; fn f() { var x = 2; return x; }");
        let inner = f
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("nested function constant");
        let code = &inner.chunk.code;
        assert!(code.contains(&(OpCode::GetLocal as u8)));
        assert!(!code.contains(&(OpCode::GetScript as u8)));
    }

    #[test]
    fn globals_route_through_global_ops() {
        let options = CompilerOptions {
            globals: vec!["println".to_string()],
            builtin_libs: Vec::new(),
        };
        let f = compile("println(1);", &options).unwrap();
        assert!(f.chunk.code.contains(&(OpCode::GetGlobal as u8)));
        assert!(!f.chunk.code.contains(&(OpCode::GetScript as u8)));
    }

    #[test]
    fn unknown_names_bind_late_to_the_script() {
        let f = compile_ok("whatever();");
        assert!(f.chunk.code.contains(&(OpCode::GetScript as u8)));
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        let err = compile_err("1 + 2 = 3;");
        assert!(err.to_string().contains("Invalid assignment target"), "{err}");
    }

    #[test]
    fn reading_local_in_own_initializer_is_an_error() {
        let err = compile_err("fn f() { var a = 1; { var a = a; } }");
        assert!(
            err.to_string().contains("own initializer"),
            "{err}"
        );
    }

    #[test]
    fn const_local_assignment_is_a_compile_error() {
        let err = compile_err("fn f() { const c = 1; c = 2; }");
        assert!(err.to_string().contains("const"), "{err}");
    }

    #[test]
    fn upvalues_are_deduplicated() {
        let f = compile_ok(
            "fn outer() { var x = 1; fn inner() { return x + x + x; } return inner; }",
        );
        let outer = f
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("outer function");
        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("inner function");
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn default_parameters_count_separately() {
        let f = compile_ok("fn f(a, b, c = 1, d = 2) {}");
        let inner = f
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("function constant");
        assert_eq!(inner.arity, 2);
        assert_eq!(inner.arity_default, 2);
        assert!(inner.chunk.code.contains(&(OpCode::DefineDefault as u8)));
    }

    #[test]
    fn non_default_after_default_is_an_error() {
        let err = compile_err("fn f(a = 1, b) {}");
        assert!(err.to_string().contains("default"), "{err}");
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        let err = compile_err("return 1;");
        assert!(err.to_string().contains("top-level"), "{err}");
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let err = compile_err("break;");
        assert!(err.to_string().contains("break"), "{err}");
    }

    #[test]
    fn this_outside_class_is_an_error() {
        let err = compile_err("var x = this;");
        assert!(err.to_string().contains("this"), "{err}");
    }

    #[test]
    fn trailing_continue_rewrites_case_to_fallthrough() {
        let f = compile_ok(
            "var x = 2; switch (x) { case 1: x = 1; continue; case 2: x = 2; }",
        );
        let code = &f.chunk.code;
        assert!(code.contains(&(OpCode::CmpJmpFall as u8)));
        assert!(code.contains(&(OpCode::CmpJmp as u8)));
    }

    #[test]
    fn cases_do_not_fall_through_by_default() {
        let f = compile_ok("switch (1) { case 1: var a = 1; case 2: var b = 2; }");
        let fall = f
            .chunk
            .code
            .iter()
            .filter(|b| **b == OpCode::CmpJmpFall as u8)
            .count();
        assert_eq!(fall, 0);
    }

    #[test]
    fn multi_value_case_folds_with_multi_case() {
        let f = compile_ok("switch (1) { case 1, 2, 3: break; }");
        let code = &f.chunk.code;
        let pos = code
            .iter()
            .position(|b| *b == OpCode::MultiCase as u8)
            .expect("multi case emitted");
        assert_eq!(code[pos + 1], 2); // two extra values
    }

    #[test]
    fn use_emits_module_ops() {
        let f = compile_ok("use \"lib\";");
        let code = &f.chunk.code;
        assert!(code.contains(&(OpCode::Use as u8)));
        assert!(code.contains(&(OpCode::UseVar as u8)));
        assert!(code.contains(&(OpCode::UseEnd as u8)));
    }

    #[test]
    fn use_builtin_routes_by_index() {
        let options = CompilerOptions {
            globals: Vec::new(),
            builtin_libs: vec!["math".to_string()],
        };
        let f = compile("use \"math\";", &options).unwrap();
        let code = &f.chunk.code;
        let pos = code
            .iter()
            .position(|b| *b == OpCode::UseBuiltin as u8)
            .expect("builtin import");
        assert_eq!(code[pos + 1], 0);
    }

    #[test]
    fn with_file_emits_open_and_close() {
        let f = compile_ok("withFile (\"a.txt\", \"r\") as f { var x = 1; }");
        let code = &f.chunk.code;
        assert!(code.contains(&(OpCode::OpenFile as u8)));
        assert!(code.contains(&(OpCode::CloseFile as u8)));
    }

    #[test]
    fn with_file_closes_on_early_return() {
        let f = compile_ok("fn f() { withFile (\"a\", \"r\") as h { return 1; } }");
        let inner = f
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("function constant");
        // One close on the return path, one on the normal path.
        let closes = inner
            .chunk
            .code
            .iter()
            .filter(|b| **b == OpCode::CloseFile as u8)
            .count();
        assert!(closes >= 2, "expected close on both exits, found {closes}");
    }

    #[test]
    fn enum_members_auto_number_by_index() {
        let f = compile_ok("enum Color { Red, Green = 9, Blue }");
        let numbers: Vec<f64> = f
            .chunk
            .constants
            .iter()
            .filter_map(|c| match c {
                Constant::Number(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert!(numbers.contains(&0.0));
        assert!(numbers.contains(&9.0));
        assert!(numbers.contains(&2.0));
    }

    #[test]
    fn import_stem_strips_path_and_extension() {
        assert_eq!(import_stem("lib"), Some("lib".to_string()));
        assert_eq!(import_stem("dir/lib.ilex"), Some("lib".to_string()));
        assert_eq!(import_stem("a/b/c/util.ilex"), Some("util".to_string()));
        assert_eq!(import_stem("no-good"), None);
    }

    #[test]
    fn method_names_are_qualified_by_class() {
        let f = compile_ok("class A { go() { return 1; } }");
        let method = f
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("method constant");
        assert_eq!(&*method.name, "A.go");
    }
}
