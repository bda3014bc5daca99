//! Two-pass assembler from the textual instruction language to a [`Module`].
//!
//! Pass one walks every line, sizes each instruction exactly, records label addresses and fills
//! the function, native and global tables. Pass two walks the same lines again and emits bytes,
//! resolving function references to signed table indices and global names to arena addresses.
//! Label operands are emitted as placeholders with a pending fix-up keyed by the label's table
//! position; once every function is emitted the fix-ups are patched with displacements relative
//! to the next instruction.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::bytecode::{
    ARGC_LEN, DISPLACEMENT_LEN, IMMEDIATE_LEN, InstructionForm, OpCode, Operand, Register, Width,
};
use crate::vm::Layout;
use crate::wire::{
    FLAG_DEBUG_MODE, FLAG_SAFE_MODE, FunctionEntry, GlobalEntry, MODULE_EXTENSION, Module,
    WireError, encode_function_index, encode_module,
};

mod lexer;
mod symbols;

pub use lexer::{Line, Token, tokenize};
pub use symbols::SymbolTable;

pub const DEFAULT_STACK_SIZE: u32 = 128;
/// Ceiling on the summed size of every `$global` in one module.
pub const MAX_DATA_SIZE: usize = 1 << 30;

#[derive(Clone, Debug, PartialEq)]
pub enum AsmErrorKind {
    Syntax(String),
    InvalidNumber(String),
    InvalidString(String),
    UnknownMnemonic(String),
    UnknownRegister(String),
    UnknownDirective(String),
    OperandCount { mnemonic: String, expected: usize },
    InvalidOperand(String),
    WidthMismatch { first: Width, second: Width },
    Redefinition(String),
    UndefinedLabel(String),
    UndefinedFunction(String),
    UndefinedNative(String),
    UndefinedGlobal(String),
    NotANative(String),
    CrossFunctionLabel(String),
    GlobalTooLarge { name: String, size: usize, len: usize },
    OutsideFunction,
    NestedFunction(String),
    UnclosedFunction(String),
    EmptyFunction(String),
    LengthMismatch { function: String, pass_one: usize, pass_two: usize },
    Wire(WireError),
    Io(String),
}

impl std::fmt::Display for AsmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsmErrorKind::Syntax(message) => write!(f, "syntax error: {message}"),
            AsmErrorKind::InvalidNumber(literal) => write!(f, "invalid number '{literal}'"),
            AsmErrorKind::InvalidString(message) => write!(f, "{message}"),
            AsmErrorKind::UnknownMnemonic(name) => write!(f, "unknown instruction '{name}'"),
            AsmErrorKind::UnknownRegister(name) => write!(f, "unknown register '{name}'"),
            AsmErrorKind::UnknownDirective(name) => write!(f, "unknown directive '${name}'"),
            AsmErrorKind::OperandCount { mnemonic, expected } => {
                write!(f, "'{mnemonic}' expects {expected} operand(s)")
            }
            AsmErrorKind::InvalidOperand(message) => write!(f, "invalid operand: {message}"),
            AsmErrorKind::WidthMismatch { first, second } => write!(
                f,
                "conflicting operand sizes '{}' and '{}'",
                first.keyword(),
                second.keyword()
            ),
            AsmErrorKind::Redefinition(name) => write!(f, "redefinition of '{name}'"),
            AsmErrorKind::UndefinedLabel(name) => write!(f, "undefined label '.{name}'"),
            AsmErrorKind::UndefinedFunction(name) => write!(f, "undefined function '%{name}'"),
            AsmErrorKind::UndefinedNative(name) => {
                write!(f, "native '%{name}' is not declared with $native")
            }
            AsmErrorKind::UndefinedGlobal(name) => write!(f, "undefined global '{name}'"),
            AsmErrorKind::NotANative(name) => {
                write!(f, "'%{name}' is a script function; use call")
            }
            AsmErrorKind::CrossFunctionLabel(name) => {
                write!(f, "label '.{name}' belongs to another function")
            }
            AsmErrorKind::GlobalTooLarge { name, size, len } => write!(
                f,
                "global '{name}' declares {size} bytes but its data needs {len}"
            ),
            AsmErrorKind::OutsideFunction => {
                write!(f, "instructions and labels must appear inside a function block")
            }
            AsmErrorKind::NestedFunction(name) => {
                write!(f, "function '%{name}' opened inside another function")
            }
            AsmErrorKind::UnclosedFunction(name) => {
                write!(f, "function '%{name}' is missing its closing '}}'")
            }
            AsmErrorKind::EmptyFunction(name) => write!(f, "function '%{name}' has no code"),
            AsmErrorKind::LengthMismatch {
                function,
                pass_one,
                pass_two,
            } => write!(
                f,
                "function '%{function}' sized {pass_one} bytes in pass one but emitted {pass_two}"
            ),
            AsmErrorKind::Wire(err) => write!(f, "module encoding failed: {err}"),
            AsmErrorKind::Io(message) => write!(f, "{message}"),
        }
    }
}

/// A fatal assembly error. `line` is 1-based; 0 means the error is not tied to a line.
#[derive(Clone, Debug, PartialEq)]
pub struct AsmError {
    pub line: usize,
    pub kind: AsmErrorKind,
}

impl AsmError {
    pub fn new(line: usize, kind: AsmErrorKind) -> Self {
        Self { line, kind }
    }
}

impl std::fmt::Display for AsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "line {}: {}", self.line, self.kind)
        }
    }
}

impl std::error::Error for AsmError {}

/// Program counter observed before an instruction, per pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcMark {
    pub line: usize,
    pub function: String,
    pub pc: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assembly {
    pub module: Module,
    pub pass_one: Vec<PcMark>,
    pub pass_two: Vec<PcMark>,
}

pub fn assemble(source: &str) -> Result<Module, AsmError> {
    Ok(assemble_with_trace(source)?.module)
}

pub fn assemble_with_trace(source: &str) -> Result<Assembly, AsmError> {
    Assembler::new().run(source)
}

/// Source path with its extension swapped for the module extension.
pub fn output_path(source: &Path) -> PathBuf {
    source.with_extension(MODULE_EXTENSION)
}

/// Assembles `source` and writes the module next to it. Nothing is written on failure.
pub fn assemble_file(source: &Path) -> Result<PathBuf, AsmError> {
    let text = std::fs::read_to_string(source).map_err(|err| {
        AsmError::new(
            0,
            AsmErrorKind::Io(format!("failed to read {}: {err}", source.display())),
        )
    })?;
    let output = output_path(source);
    if output == source {
        return Err(AsmError::new(
            0,
            AsmErrorKind::Io(format!("{} already has the module extension", source.display())),
        ));
    }
    let module = assemble(&text)?;
    let bytes = encode_module(&module).map_err(|err| AsmError::new(0, AsmErrorKind::Wire(err)))?;
    std::fs::write(&output, bytes).map_err(|err| {
        AsmError::new(
            0,
            AsmErrorKind::Io(format!("failed to write {}: {err}", output.display())),
        )
    })?;
    debug!(
        source = %source.display(),
        output = %output.display(),
        "module written"
    );
    Ok(output)
}

struct FunctionSymbol {
    native: bool,
    line: usize,
    code: Vec<u8>,
    pass_one_len: usize,
}

struct LabelSymbol {
    function: usize,
    address: usize,
}

/// Label operand emitted as a zero placeholder, patched once every function is emitted.
struct Fixup {
    label: usize,
    function: usize,
    patch: usize,
    next: usize,
    line: usize,
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Register(Register),
    Int(i64),
    Float(f64),
    Memory { base: Register, displacement: i32 },
    Label(String),
    Function(String),
    Global(String),
}

impl Expr {
    fn encoded_len(&self) -> usize {
        1 + match self {
            Expr::Register(_) => 1,
            Expr::Memory { .. } => 1 + DISPLACEMENT_LEN,
            _ => IMMEDIATE_LEN,
        }
    }

    fn is_symbolic_immediate(&self) -> bool {
        !matches!(self, Expr::Register(_) | Expr::Memory { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

struct Statement {
    opcode: OpCode,
    width: Width,
    operands: Vec<Expr>,
    argc: Option<u32>,
}

impl Statement {
    fn encoded_len(&self) -> usize {
        1 + self.operands.iter().map(Expr::encoded_len).sum::<usize>()
            + self.argc.map_or(0, |_| ARGC_LEN)
    }
}

pub struct Assembler {
    stack_size: u32,
    flags: u8,
    functions: SymbolTable<FunctionSymbol>,
    globals: SymbolTable<Vec<u8>>,
    labels: SymbolTable<LabelSymbol>,
    fixups: Vec<Fixup>,
    pass_one: Vec<PcMark>,
    pass_two: Vec<PcMark>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            flags: 0,
            functions: SymbolTable::new(),
            globals: SymbolTable::new(),
            labels: SymbolTable::new(),
            fixups: Vec::new(),
            pass_one: Vec::new(),
            pass_two: Vec::new(),
        }
    }

    pub fn run(mut self, source: &str) -> Result<Assembly, AsmError> {
        let lines = tokenize(source)?;

        let mut current = None;
        let mut pc = 0;
        for line in &lines {
            self.pass_one_line(line, &mut current, &mut pc)
                .map_err(|kind| AsmError::new(line.number, kind))?;
        }
        if let Some((name, symbol)) = current.and_then(|position| self.function_at(position)) {
            return Err(AsmError::new(
                symbol.line,
                AsmErrorKind::UnclosedFunction(name.to_string()),
            ));
        }

        let offsets = Layout::new(
            self.stack_size as usize,
            self.globals.iter().map(|(_, data)| data.len()),
            0,
        )
        .global_offsets;
        let mut current = None;
        for line in &lines {
            self.pass_two_line(line, &mut current, &offsets)
                .map_err(|kind| AsmError::new(line.number, kind))?;
        }
        self.resolve_fixups()?;
        Ok(self.finish())
    }

    fn function_at(&self, position: usize) -> Option<(&str, &FunctionSymbol)> {
        Some((self.functions.name_at(position)?, self.functions.at(position)?))
    }

    fn function_name(&self, position: usize) -> Result<String, AsmErrorKind> {
        self.functions
            .name_at(position)
            .map(str::to_string)
            .ok_or(AsmErrorKind::OutsideFunction)
    }

    fn pass_one_line(
        &mut self,
        line: &Line,
        current: &mut Option<usize>,
        pc: &mut usize,
    ) -> Result<(), AsmErrorKind> {
        let mut cursor = LineCursor::new(&line.tokens);
        match cursor.peek() {
            Some(Token::Directive(_)) => self.directive(&mut cursor, line.number),
            Some(Token::Function(_)) => {
                let name = cursor.function()?;
                cursor.expect(&Token::LBrace)?;
                cursor.end()?;
                if current.is_some() {
                    return Err(AsmErrorKind::NestedFunction(name.to_string()));
                }
                let symbol = FunctionSymbol {
                    native: false,
                    line: line.number,
                    code: Vec::new(),
                    pass_one_len: 0,
                };
                let position = self
                    .functions
                    .insert(name, symbol)
                    .ok_or_else(|| AsmErrorKind::Redefinition(name.to_string()))?;
                *current = Some(position);
                *pc = 0;
                Ok(())
            }
            Some(Token::RBrace) => {
                cursor.next();
                cursor.end()?;
                let position = current
                    .take()
                    .ok_or_else(|| AsmErrorKind::Syntax("unmatched '}'".to_string()))?;
                if *pc == 0 {
                    return Err(AsmErrorKind::EmptyFunction(self.function_name(position)?));
                }
                if let Some(symbol) = self.functions.at_mut(position) {
                    symbol.pass_one_len = *pc;
                }
                Ok(())
            }
            _ => {
                if let Some(Token::Label(name)) = cursor.peek() {
                    cursor.next();
                    cursor.eat(&Token::Colon);
                    let function = current.ok_or(AsmErrorKind::OutsideFunction)?;
                    let label = LabelSymbol {
                        function,
                        address: *pc,
                    };
                    self.labels
                        .insert(name, label)
                        .ok_or_else(|| AsmErrorKind::Redefinition(format!(".{name}")))?;
                }
                if cursor.is_empty() {
                    return Ok(());
                }
                let function = current.ok_or(AsmErrorKind::OutsideFunction)?;
                let statement = parse_statement(&mut cursor)?;
                let name = self.function_name(function)?;
                self.pass_one.push(PcMark {
                    line: line.number,
                    function: name,
                    pc: *pc,
                });
                *pc += statement.encoded_len();
                Ok(())
            }
        }
    }

    fn pass_two_line(
        &mut self,
        line: &Line,
        current: &mut Option<usize>,
        offsets: &[usize],
    ) -> Result<(), AsmErrorKind> {
        let mut cursor = LineCursor::new(&line.tokens);
        match cursor.peek() {
            Some(Token::Directive(_)) => Ok(()),
            Some(Token::Function(name)) => {
                *current = self.functions.position(name);
                Ok(())
            }
            Some(Token::RBrace) => {
                if let Some((name, symbol)) = current
                    .take()
                    .and_then(|position| self.function_at(position))
                {
                    if symbol.code.len() != symbol.pass_one_len {
                        return Err(AsmErrorKind::LengthMismatch {
                            function: name.to_string(),
                            pass_one: symbol.pass_one_len,
                            pass_two: symbol.code.len(),
                        });
                    }
                }
                Ok(())
            }
            _ => {
                if let Some(Token::Label(_)) = cursor.peek() {
                    cursor.next();
                    cursor.eat(&Token::Colon);
                }
                if cursor.is_empty() {
                    return Ok(());
                }
                let function = current.ok_or(AsmErrorKind::OutsideFunction)?;
                let statement = parse_statement(&mut cursor)?;
                let (name, pc) = self
                    .function_at(function)
                    .map(|(name, symbol)| (name.to_string(), symbol.code.len()))
                    .ok_or(AsmErrorKind::OutsideFunction)?;
                self.pass_two.push(PcMark {
                    line: line.number,
                    function: name,
                    pc,
                });

                let mut bytes = Vec::with_capacity(statement.encoded_len());
                self.encode(&statement, function, pc, offsets, line.number, &mut bytes)?;
                if let Some(symbol) = self.functions.at_mut(function) {
                    symbol.code.extend_from_slice(&bytes);
                }
                Ok(())
            }
        }
    }

    fn directive(&mut self, cursor: &mut LineCursor<'_>, line: usize) -> Result<(), AsmErrorKind> {
        let Some(Token::Directive(name)) = cursor.next() else {
            return Err(AsmErrorKind::Syntax("expected a directive".to_string()));
        };
        match name.as_str() {
            "stacksize" => {
                let size = cursor.int("stack size")?;
                cursor.end()?;
                self.stack_size = u32::try_from(size)
                    .ok()
                    .filter(|size| *size > 0)
                    .ok_or_else(|| {
                        AsmErrorKind::InvalidOperand(format!("stack size {size} out of range"))
                    })?;
            }
            "global" => {
                let name = cursor.ident("global name")?;
                if is_reserved(name) {
                    return Err(AsmErrorKind::InvalidOperand(format!(
                        "'{name}' is reserved and cannot name a global"
                    )));
                }
                let size = cursor.int("global size")?;
                let declared: usize = self.globals.iter().map(|(_, data)| data.len()).sum();
                let size = usize::try_from(size)
                    .ok()
                    .filter(|size| declared.saturating_add(*size) <= MAX_DATA_SIZE)
                    .ok_or_else(|| {
                        AsmErrorKind::InvalidOperand(format!(
                            "global size {size} is negative or overruns the {MAX_DATA_SIZE}-byte data segment limit"
                        ))
                    })?;
                let data = global_data(cursor, name, size)?;
                self.globals
                    .insert(name, data)
                    .ok_or_else(|| AsmErrorKind::Redefinition(name.to_string()))?;
            }
            "native" => {
                let name = cursor.function()?;
                cursor.end()?;
                let symbol = FunctionSymbol {
                    native: true,
                    line,
                    code: Vec::new(),
                    pass_one_len: 0,
                };
                self.functions
                    .insert(name, symbol)
                    .ok_or_else(|| AsmErrorKind::Redefinition(name.to_string()))?;
            }
            "safemode" => {
                cursor.end()?;
                self.flags |= FLAG_SAFE_MODE;
            }
            "debugmode" => {
                cursor.end()?;
                self.flags |= FLAG_DEBUG_MODE;
            }
            other => return Err(AsmErrorKind::UnknownDirective(other.to_string())),
        }
        Ok(())
    }

    fn encode(
        &mut self,
        statement: &Statement,
        function: usize,
        pc: usize,
        offsets: &[usize],
        line: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), AsmErrorKind> {
        let next = pc + statement.encoded_len();
        out.push(statement.opcode as u8);
        for expr in &statement.operands {
            if let Expr::Label(name) = expr {
                let label = self
                    .labels
                    .position(name)
                    .ok_or_else(|| AsmErrorKind::UndefinedLabel(name.clone()))?;
                // The payload follows the operand's mode byte.
                self.fixups.push(Fixup {
                    label,
                    function,
                    patch: pc + out.len() + 1,
                    next,
                    line,
                });
            }
            let operand = self.lower(expr, statement, offsets)?;
            operand.encode(statement.width, out);
        }
        if let Some(argc) = statement.argc {
            out.extend_from_slice(&argc.to_le_bytes());
        }
        Ok(())
    }

    fn lower(
        &self,
        expr: &Expr,
        statement: &Statement,
        offsets: &[usize],
    ) -> Result<Operand, AsmErrorKind> {
        Ok(match expr {
            Expr::Register(register) => Operand::Register(*register),
            Expr::Memory { base, displacement } => Operand::Indirect {
                base: *base,
                displacement: *displacement,
            },
            Expr::Int(value) if statement.opcode.is_float() => {
                Operand::Immediate(float_immediate(*value as f64, statement.width)?)
            }
            Expr::Int(value) => Operand::Immediate(*value),
            Expr::Float(value) => Operand::Immediate(float_immediate(*value, statement.width)?),
            Expr::Label(_) => Operand::Immediate(0),
            Expr::Function(name) => {
                let syscall = statement.opcode == OpCode::Syscall;
                let Some(position) = self.functions.position(name) else {
                    return Err(if syscall {
                        AsmErrorKind::UndefinedNative(name.clone())
                    } else {
                        AsmErrorKind::UndefinedFunction(name.clone())
                    });
                };
                let native = self
                    .functions
                    .at(position)
                    .is_some_and(|symbol| symbol.native);
                if syscall && !native {
                    return Err(AsmErrorKind::NotANative(name.clone()));
                }
                Operand::Immediate(encode_function_index(position, native))
            }
            Expr::Global(name) => {
                let position = self
                    .globals
                    .position(name)
                    .ok_or_else(|| AsmErrorKind::UndefinedGlobal(name.clone()))?;
                Operand::Immediate(offsets[position] as i64)
            }
        })
    }

    /// Patches every label placeholder with `label address - next pc`.
    fn resolve_fixups(&mut self) -> Result<(), AsmError> {
        for fixup in std::mem::take(&mut self.fixups) {
            let name = self.labels.name_at(fixup.label).unwrap_or_default().to_string();
            let label = self
                .labels
                .at(fixup.label)
                .ok_or_else(|| AsmError::new(fixup.line, AsmErrorKind::UndefinedLabel(name.clone())))?;
            if label.function != fixup.function {
                return Err(AsmError::new(
                    fixup.line,
                    AsmErrorKind::CrossFunctionLabel(name),
                ));
            }
            let displacement = label.address as i64 - fixup.next as i64;
            let slot = self
                .functions
                .at_mut(fixup.function)
                .and_then(|symbol| {
                    symbol
                        .code
                        .get_mut(fixup.patch..fixup.patch + IMMEDIATE_LEN)
                })
                .ok_or_else(|| {
                    AsmError::new(
                        fixup.line,
                        AsmErrorKind::Syntax(format!("label '.{name}' patch out of range")),
                    )
                })?;
            slot.copy_from_slice(&displacement.to_le_bytes());
        }
        Ok(())
    }

    fn finish(self) -> Assembly {
        let mut module = Module::new(self.stack_size);
        module.flags = self.flags;
        module.functions = self
            .functions
            .into_entries()
            .map(|(name, symbol)| {
                if symbol.native {
                    FunctionEntry::native(name)
                } else {
                    FunctionEntry::script(name, symbol.code)
                }
            })
            .collect();
        module.globals = self
            .globals
            .into_entries()
            .map(|(name, data)| GlobalEntry { name, data })
            .collect();
        debug!(
            functions = module.functions.len(),
            globals = module.globals.len(),
            stack_size = module.stack_size,
            "assembled module"
        );
        Assembly {
            module,
            pass_one: self.pass_one,
            pass_two: self.pass_two,
        }
    }
}

fn is_reserved(name: &str) -> bool {
    name == Register::Rip.name()
        || Register::parse(name).is_some()
        || Width::parse_keyword(name).is_some()
        || OpCode::parse_mnemonic(name).is_some()
}

fn float_immediate(value: f64, width: Width) -> Result<i64, AsmErrorKind> {
    match width {
        Width::Long => Ok((value as f32).to_bits() as i64),
        Width::Word => Ok(value.to_bits() as i64),
        _ => Err(AsmErrorKind::InvalidOperand(
            "float values need a long or word size".to_string(),
        )),
    }
}

/// `"text"`, a bare integer, or `<size> v, v, ...`; the result is zero-padded to `size`.
fn global_data(
    cursor: &mut LineCursor<'_>,
    name: &str,
    size: usize,
) -> Result<Vec<u8>, AsmErrorKind> {
    let mut data = Vec::new();
    match cursor.peek() {
        None => {}
        Some(Token::Str(bytes)) => {
            cursor.next();
            data.extend_from_slice(bytes);
        }
        Some(Token::Ident(word)) => {
            let width = Width::parse_keyword(word).ok_or_else(|| {
                AsmErrorKind::Syntax(format!("expected a data size, found '{word}'"))
            })?;
            cursor.next();
            loop {
                let value = match cursor.literal("data value")? {
                    Number::Float(value) => float_immediate(value, width)? as u64,
                    Number::Int(value) => value as u64,
                };
                data.extend_from_slice(&value.to_le_bytes()[..width.bytes()]);
                if !cursor.eat(&Token::Comma) {
                    break;
                }
            }
        }
        Some(_) => {
            let value = match cursor.literal("global value")? {
                Number::Int(value) => value,
                Number::Float(_) => {
                    return Err(AsmErrorKind::InvalidOperand(
                        "bare global values must be integers; prefix floats with a size"
                            .to_string(),
                    ));
                }
            };
            let bytes = value.to_le_bytes();
            data.extend_from_slice(&bytes[..size.min(bytes.len())]);
        }
    }
    cursor.end()?;
    if data.len() > size {
        return Err(AsmErrorKind::GlobalTooLarge {
            name: name.to_string(),
            size,
            len: data.len(),
        });
    }
    data.resize(size, 0);
    Ok(data)
}

fn parse_statement(cursor: &mut LineCursor<'_>) -> Result<Statement, AsmErrorKind> {
    let mnemonic = cursor.ident("instruction")?;
    let opcode = OpCode::parse_mnemonic(mnemonic)
        .ok_or_else(|| AsmErrorKind::UnknownMnemonic(mnemonic.to_string()))?;

    let mut width = None;
    if let Some(Token::Ident(word)) = cursor.peek()
        && let Some(keyword) = Width::parse_keyword(word)
    {
        cursor.next();
        width = Some(keyword);
    }

    let expected = match opcode.form() {
        InstructionForm::NoOperand => 0,
        InstructionForm::Unary | InstructionForm::Syscall => 1,
        InstructionForm::Binary => 2,
    };
    let count_error = || AsmErrorKind::OperandCount {
        mnemonic: mnemonic.to_string(),
        expected,
    };

    let mut operands = Vec::with_capacity(expected);
    for index in 0..expected {
        if index > 0 && !cursor.eat(&Token::Comma) {
            return Err(count_error());
        }
        if cursor.is_empty() {
            return Err(count_error());
        }
        let (expr, memory_width) = parse_operand(cursor)?;
        if let Some(memory_width) = memory_width {
            match width {
                Some(first) if first != memory_width => {
                    return Err(AsmErrorKind::WidthMismatch {
                        first,
                        second: memory_width,
                    });
                }
                _ => width = Some(memory_width),
            }
        }
        operands.push(expr);
    }

    let mut argc = None;
    if opcode.form() == InstructionForm::Syscall {
        if !cursor.eat(&Token::Comma) {
            return Err(AsmErrorKind::Syntax(
                "syscall needs an argument count: syscall %name, argc".to_string(),
            ));
        }
        let count = cursor.int("argument count")?;
        argc = Some(u32::try_from(count).map_err(|_| {
            AsmErrorKind::InvalidOperand(format!("argument count {count} out of range"))
        })?);
    }
    if cursor.peek() == Some(&Token::Comma) {
        return Err(count_error());
    }
    cursor.end()?;

    let statement = Statement {
        opcode,
        width: width.unwrap_or(Width::Word),
        operands,
        argc,
    };
    check_operands(&statement)?;
    Ok(statement)
}

fn parse_operand(cursor: &mut LineCursor<'_>) -> Result<(Expr, Option<Width>), AsmErrorKind> {
    match cursor.peek() {
        Some(Token::LBracket) => {
            cursor.next();
            let mut width = None;
            let mut base = cursor.ident("base register")?;
            if let Some(keyword) = Width::parse_keyword(base) {
                width = Some(keyword);
                base = cursor.ident("base register")?;
            }
            let base = Register::parse(base)
                .ok_or_else(|| AsmErrorKind::UnknownRegister(base.to_string()))?;
            let mut displacement = 0i64;
            if cursor.eat(&Token::Plus) {
                displacement = cursor.int("displacement")?;
            } else if cursor.eat(&Token::Minus) {
                displacement = cursor.int("displacement")?.wrapping_neg();
            }
            let displacement = i32::try_from(displacement).map_err(|_| {
                AsmErrorKind::InvalidOperand(format!("displacement {displacement} out of range"))
            })?;
            cursor.expect(&Token::RBracket)?;
            Ok((Expr::Memory { base, displacement }, width))
        }
        Some(Token::Ident(name)) => {
            cursor.next();
            if let Some(register) = Register::parse(name) {
                return Ok((Expr::Register(register), None));
            }
            if is_reserved(name) {
                return Err(AsmErrorKind::UnknownRegister(name.clone()));
            }
            Ok((Expr::Global(name.clone()), None))
        }
        Some(Token::Label(name)) => {
            cursor.next();
            Ok((Expr::Label(name.clone()), None))
        }
        Some(Token::Function(name)) => {
            cursor.next();
            Ok((Expr::Function(name.clone()), None))
        }
        _ => Ok((
            match cursor.literal("operand")? {
                Number::Int(value) => Expr::Int(value),
                Number::Float(value) => Expr::Float(value),
            },
            None,
        )),
    }
}

fn check_operands(statement: &Statement) -> Result<(), AsmErrorKind> {
    let invalid = |message: &str| Err(AsmErrorKind::InvalidOperand(message.to_string()));
    let opcode = statement.opcode;
    let Some(first) = statement.operands.first() else {
        return Ok(());
    };

    if opcode.is_float() && matches!(statement.width, Width::Byte | Width::Half) {
        return invalid("float instructions take a long or word size");
    }
    if opcode.is_conversion() && !matches!(first, Expr::Register(_)) {
        return invalid("conversions operate on a register");
    }
    if opcode.writes_destination() && first.is_symbolic_immediate() {
        return invalid("destination must be a register or memory operand");
    }
    if let [lhs, rhs] = statement.operands.as_slice() {
        if matches!(lhs, Expr::Memory { .. }) && matches!(rhs, Expr::Memory { .. }) {
            return invalid("memory-to-memory operands are not encodable");
        }
        if matches!(rhs, Expr::Label(_)) {
            return invalid("labels are only valid as jump targets");
        }
    }
    if opcode.is_jump() {
        if !matches!(first, Expr::Label(_) | Expr::Register(_)) {
            return invalid("jump target must be a label or register");
        }
    } else if matches!(first, Expr::Label(_)) {
        return invalid("labels are only valid as jump targets");
    }
    if matches!(opcode, OpCode::Call | OpCode::Syscall)
        && !matches!(
            first,
            Expr::Function(_) | Expr::Register(_) | Expr::Memory { .. }
        )
    {
        return invalid("call target must be a %function, register or memory operand");
    }
    Ok(())
}

struct LineCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> LineCursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), AsmErrorKind> {
        if self.eat(expected) {
            return Ok(());
        }
        Err(AsmErrorKind::Syntax(match self.peek() {
            Some(found) => format!("expected {}, found {}", expected.describe(), found.describe()),
            None => format!("expected {}", expected.describe()),
        }))
    }

    fn end(&self) -> Result<(), AsmErrorKind> {
        match self.peek() {
            None => Ok(()),
            Some(found) => Err(AsmErrorKind::Syntax(format!(
                "unexpected {} at end of line",
                found.describe()
            ))),
        }
    }

    fn ident(&mut self, what: &str) -> Result<&'a str, AsmErrorKind> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            Some(found) => Err(AsmErrorKind::Syntax(format!(
                "expected {what}, found {}",
                found.describe()
            ))),
            None => Err(AsmErrorKind::Syntax(format!("missing {what}"))),
        }
    }

    fn function(&mut self) -> Result<&'a str, AsmErrorKind> {
        match self.next() {
            Some(Token::Function(name)) => Ok(name),
            Some(found) => Err(AsmErrorKind::Syntax(format!(
                "expected %name, found {}",
                found.describe()
            ))),
            None => Err(AsmErrorKind::Syntax("missing %name".to_string())),
        }
    }

    /// Integer or float, with an optional leading `-`.
    fn literal(&mut self, what: &str) -> Result<Number, AsmErrorKind> {
        let negative = self.eat(&Token::Minus);
        match self.next() {
            Some(Token::Int(value)) => Ok(Number::Int(if negative {
                value.wrapping_neg()
            } else {
                *value
            })),
            Some(Token::Float(value)) => Ok(Number::Float(if negative { -value } else { *value })),
            Some(found) => Err(AsmErrorKind::Syntax(format!(
                "expected {what}, found {}",
                found.describe()
            ))),
            None => Err(AsmErrorKind::Syntax(format!("missing {what}"))),
        }
    }

    fn int(&mut self, what: &str) -> Result<i64, AsmErrorKind> {
        match self.literal(what)? {
            Number::Int(value) => Ok(value),
            Number::Float(_) => Err(AsmErrorKind::Syntax(format!("{what} must be an integer"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_encoded_lengths() {
        let assembly = assemble_with_trace(
            "%main {\n  mov ra, 5\n  add long [rsp-8], rb\n  syscall %main, 0\n}\n$native %puts\n",
        );
        let err = assembly.expect_err("syscall to script");
        assert_eq!(err.line, 4);
        assert_eq!(err.kind, AsmErrorKind::NotANative("main".into()));

        let assembly = assemble_with_trace("%main {\n  mov ra, 5\n  add long [rsp-8], rb\n  halt\n}")
            .expect("assemble");
        let pcs: Vec<usize> = assembly.pass_one.iter().map(|mark| mark.pc).collect();
        assert_eq!(pcs, vec![0, 1 + 2 + 9, 1 + 2 + 9 + 1 + 6 + 2]);
        assert_eq!(assembly.pass_one, assembly.pass_two);
        assert_eq!(assembly.module.functions[0].code().len(), 12 + 9 + 1);
    }

    #[test]
    fn global_data_forms() {
        let module = assemble(
            "$global msg 8 \"hi\"\n$global zero 4 0\n$global nums 6 half 1, -1\n$global pi 8 word 0.5\n%main {\n halt\n}",
        )
        .expect("assemble");
        let data: Vec<&[u8]> = module.globals.iter().map(|g| g.data.as_slice()).collect();
        assert_eq!(data[0], b"hi\0\0\0\0\0\0");
        assert_eq!(data[1], &[0, 0, 0, 0]);
        assert_eq!(data[2], &[1, 0, 0xFF, 0xFF, 0, 0]);
        assert_eq!(data[3], &0.5f64.to_bits().to_le_bytes());

        let err = assemble("$global s 2 \"abc\"").expect_err("too long");
        assert!(matches!(err.kind, AsmErrorKind::GlobalTooLarge { len: 3, .. }));
    }

    #[test]
    fn operand_restrictions() {
        for (source, needle) in [
            ("%f {\n mov [ra], [rb]\n}", "memory-to-memory"),
            ("%f {\n mov 5, ra\n}", "destination"),
            ("%f {\n itof [ra]\n}", "conversions"),
            ("%f {\n fadd byte ra, rb\n}", "float"),
        ] {
            let err = assemble(source).expect_err(source);
            assert_eq!(err.line, 2, "{source}");
            assert!(err.to_string().contains(needle), "{err}");
        }
        let err = assemble("%f {\n mov ra, rip\n}").expect_err("rip");
        assert_eq!(err.kind, AsmErrorKind::UnknownRegister("rip".into()));
        let err = assemble("%f {\n push long [byte rsp]\n}").expect_err("sizes");
        assert!(matches!(err.kind, AsmErrorKind::WidthMismatch { .. }));
    }
}
