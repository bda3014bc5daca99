use std::collections::HashSet;
use std::fmt::Write;

use crate::bytecode::{
    DecodeError, InstructionForm, OpCode, Operand, Width, decode_argc, decode_operand,
};

pub const MAGIC: [u8; 4] = *b"RGVM";
pub const VERSION: u16 = 1;
pub const MODULE_EXTENSION: &str = "rbc";

pub const FLAG_SAFE_MODE: u8 = 0x01;
pub const FLAG_DEBUG_MODE: u8 = 0x02;
const KNOWN_FLAGS: u8 = FLAG_SAFE_MODE | FLAG_DEBUG_MODE;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FunctionBody {
    Script(Vec<u8>),
    Native,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionEntry {
    pub name: String,
    pub body: FunctionBody,
}

impl FunctionEntry {
    pub fn script(name: impl Into<String>, code: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            body: FunctionBody::Script(code),
        }
    }

    pub fn native(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: FunctionBody::Native,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, FunctionBody::Native)
    }

    pub fn code(&self) -> &[u8] {
        match &self.body {
            FunctionBody::Script(code) => code,
            FunctionBody::Native => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// A compiled module: everything the loader needs to build an engine image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub stack_size: u32,
    pub flags: u8,
    pub functions: Vec<FunctionEntry>,
    pub globals: Vec<GlobalEntry>,
}

impl Module {
    pub fn new(stack_size: u32) -> Self {
        Self {
            stack_size,
            flags: 0,
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn safe_mode(&self) -> bool {
        self.flags & FLAG_SAFE_MODE != 0
    }

    pub fn debug_mode(&self) -> bool {
        self.flags & FLAG_DEBUG_MODE != 0
    }

    /// Signed call index of a function table entry: `+(position + 1)` for scripts,
    /// `-(position + 1)` for natives.
    pub fn function_index(&self, name: &str) -> Option<i64> {
        let position = self.functions.iter().position(|entry| entry.name == name)?;
        Some(encode_function_index(
            position,
            self.functions[position].is_native(),
        ))
    }
}

pub fn encode_function_index(position: usize, native: bool) -> i64 {
    let magnitude = position as i64 + 1;
    if native { -magnitude } else { magnitude }
}

/// Table position for a signed call index, or `None` for 0.
pub fn decode_function_index(index: i64) -> Option<(usize, bool)> {
    if index == 0 {
        return None;
    }
    let position = usize::try_from(index.unsigned_abs() - 1).ok()?;
    Some((position, index < 0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    UnexpectedEof,
    InvalidMagic([u8; 4]),
    UnsupportedVersion(u16),
    UnsupportedFlags(u8),
    InvalidNativeFlag(u8),
    InvalidUtf8,
    NativeWithCode(String),
    DuplicateName(String),
    LengthTooLarge(&'static str, usize),
    TrailingBytes,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::UnexpectedEof => write!(f, "unexpected end of input"),
            WireError::InvalidMagic(found) => write!(f, "invalid magic: {found:?}"),
            WireError::UnsupportedVersion(version) => {
                write!(f, "unsupported version: {version}")
            }
            WireError::UnsupportedFlags(flags) => write!(f, "unsupported flags: {flags:#04x}"),
            WireError::InvalidNativeFlag(value) => write!(f, "invalid native flag: {value}"),
            WireError::InvalidUtf8 => write!(f, "invalid utf-8 string"),
            WireError::NativeWithCode(name) => {
                write!(f, "native function '{name}' carries bytecode")
            }
            WireError::DuplicateName(name) => write!(f, "duplicate table entry '{name}'"),
            WireError::LengthTooLarge(field, len) => {
                write!(f, "{field} length too large: {len}")
            }
            WireError::TrailingBytes => write!(f, "trailing bytes after module payload"),
        }
    }
}

impl std::error::Error for WireError {}

pub fn encode_module(module: &Module) -> Result<Vec<u8>, WireError> {
    if module.flags & !KNOWN_FLAGS != 0 {
        return Err(WireError::UnsupportedFlags(module.flags));
    }
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&module.stack_size.to_le_bytes());
    out.push(module.flags);

    write_u32_len("functions", module.functions.len(), &mut out)?;
    for function in &module.functions {
        out.push(function.is_native() as u8);
        write_bytes("function name", function.name.as_bytes(), &mut out)?;
        write_bytes("function code", function.code(), &mut out)?;
    }

    write_u32_len("globals", module.globals.len(), &mut out)?;
    for global in &module.globals {
        write_bytes("global name", global.name.as_bytes(), &mut out)?;
        write_bytes("global data", &global.data, &mut out)?;
    }
    Ok(out)
}

pub fn decode_module(bytes: &[u8]) -> Result<Module, WireError> {
    let mut cursor = Cursor::new(bytes);
    let magic = cursor.read_exact_array::<4>()?;
    if magic != MAGIC {
        return Err(WireError::InvalidMagic(magic));
    }
    let version = cursor.read_u16()?;
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let stack_size = cursor.read_u32()?;
    let flags = cursor.read_u8()?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(WireError::UnsupportedFlags(flags));
    }

    let mut names = HashSet::new();
    let function_count = cursor.read_u32()? as usize;
    let mut functions = Vec::with_capacity(function_count.min(cursor.remaining()));
    for _ in 0..function_count {
        let native = match cursor.read_u8()? {
            0 => false,
            1 => true,
            other => return Err(WireError::InvalidNativeFlag(other)),
        };
        let name = cursor.read_string()?;
        let code = cursor.read_bytes()?;
        if !names.insert(name.clone()) {
            return Err(WireError::DuplicateName(name));
        }
        let body = if native {
            if !code.is_empty() {
                return Err(WireError::NativeWithCode(name));
            }
            FunctionBody::Native
        } else {
            FunctionBody::Script(code.to_vec())
        };
        functions.push(FunctionEntry { name, body });
    }

    names.clear();
    let global_count = cursor.read_u32()? as usize;
    let mut globals = Vec::with_capacity(global_count.min(cursor.remaining()));
    for _ in 0..global_count {
        let name = cursor.read_string()?;
        let data = cursor.read_bytes()?.to_vec();
        if !names.insert(name.clone()) {
            return Err(WireError::DuplicateName(name));
        }
        globals.push(GlobalEntry { name, data });
    }

    if !cursor.is_eof() {
        return Err(WireError::TrailingBytes);
    }
    Ok(Module {
        stack_size,
        flags,
        functions,
        globals,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidOpcode {
        function: String,
        offset: usize,
        opcode: u8,
    },
    MalformedOperand {
        function: String,
        offset: usize,
        error: DecodeError,
    },
    InvalidCall {
        function: String,
        offset: usize,
        index: i64,
    },
    InvalidJumpTarget {
        function: String,
        offset: usize,
        target: i64,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidOpcode {
                function,
                offset,
                opcode,
            } => write!(f, "{function}+{offset}: invalid opcode {opcode:#04x}"),
            ValidationError::MalformedOperand {
                function,
                offset,
                error,
            } => write!(f, "{function}+{offset}: malformed operand ({error:?})"),
            ValidationError::InvalidCall {
                function,
                offset,
                index,
            } => write!(f, "{function}+{offset}: call index {index} outside function table"),
            ValidationError::InvalidJumpTarget {
                function,
                offset,
                target,
            } => write!(
                f,
                "{function}+{offset}: jump target {target} is not an instruction boundary"
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub offset: usize,
    pub len: usize,
    pub opcode: OpCode,
    pub operands: Vec<(Operand, Width)>,
    pub argc: Option<u32>,
}

/// Decodes one instruction at `offset` of a function body.
pub fn decode_instruction(code: &[u8], offset: usize) -> Result<DecodedInstruction, ValidationFault> {
    let byte = *code.get(offset).ok_or(ValidationFault::Operand(DecodeError::Truncated))?;
    let opcode = OpCode::from_u8(byte).ok_or(ValidationFault::Opcode(byte))?;
    let mut pos = offset + 1;
    let mut operands = Vec::new();
    let mut argc = None;
    let count = match opcode.form() {
        InstructionForm::NoOperand => 0,
        InstructionForm::Unary | InstructionForm::Syscall => 1,
        InstructionForm::Binary => 2,
    };
    for _ in 0..count {
        operands.push(decode_operand(code, &mut pos).map_err(ValidationFault::Operand)?);
    }
    if opcode.form() == InstructionForm::Syscall {
        argc = Some(decode_argc(code, &mut pos).map_err(ValidationFault::Operand)?);
    }
    Ok(DecodedInstruction {
        offset,
        len: pos - offset,
        opcode,
        operands,
        argc,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationFault {
    Opcode(u8),
    Operand(DecodeError),
}

/// Static checks over every script function: decodable instructions, immediate call indices
/// inside the function table, immediate jumps landing on an instruction boundary of the same
/// function.
pub fn validate_module(module: &Module) -> Result<(), ValidationError> {
    for function in &module.functions {
        let FunctionBody::Script(code) = &function.body else {
            continue;
        };
        let instructions = decode_function(function)?;
        let boundaries: HashSet<usize> = instructions
            .iter()
            .map(|instruction| instruction.offset)
            .chain(std::iter::once(code.len()))
            .collect();

        for instruction in &instructions {
            let Some((Operand::Immediate(value), _)) = instruction.operands.first().copied() else {
                continue;
            };
            let end = instruction.offset + instruction.len;
            match instruction.opcode {
                op if op.is_jump() => {
                    let target = end as i64 + value;
                    let lands = usize::try_from(target)
                        .map(|target| target < code.len() && boundaries.contains(&target))
                        .unwrap_or(false);
                    if !lands {
                        return Err(ValidationError::InvalidJumpTarget {
                            function: function.name.clone(),
                            offset: instruction.offset,
                            target,
                        });
                    }
                }
                OpCode::Call | OpCode::Syscall => {
                    let resolved = decode_function_index(value).and_then(|(position, native)| {
                        let entry = module.functions.get(position)?;
                        (entry.is_native() == native).then_some(())
                    });
                    let native_only = instruction.opcode == OpCode::Syscall && value > 0;
                    if resolved.is_none() || native_only {
                        return Err(ValidationError::InvalidCall {
                            function: function.name.clone(),
                            offset: instruction.offset,
                            index: value,
                        });
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn decode_function(function: &FunctionEntry) -> Result<Vec<DecodedInstruction>, ValidationError> {
    let code = function.code();
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let instruction = decode_instruction(code, offset).map_err(|fault| match fault {
            ValidationFault::Opcode(opcode) => ValidationError::InvalidOpcode {
                function: function.name.clone(),
                offset,
                opcode,
            },
            ValidationFault::Operand(error) => ValidationError::MalformedOperand {
                function: function.name.clone(),
                offset,
                error,
            },
        })?;
        offset += instruction.len;
        out.push(instruction);
    }
    Ok(out)
}

pub fn disassemble_module(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "module stack={} flags={:#04x} functions={} globals={}",
        module.stack_size,
        module.flags,
        module.functions.len(),
        module.globals.len()
    );
    for global in &module.globals {
        let _ = writeln!(
            &mut out,
            "$global {} {} ; {}",
            global.name,
            global.data.len(),
            hex_preview(&global.data)
        );
    }
    for (position, function) in module.functions.iter().enumerate() {
        let index = encode_function_index(position, function.is_native());
        if function.is_native() {
            let _ = writeln!(&mut out, "$native %{} ; index {index}", function.name);
            continue;
        }
        let _ = writeln!(&mut out, "%{} {{ ; index {index}", function.name);
        let code = function.code();
        let mut offset = 0;
        while offset < code.len() {
            match decode_instruction(code, offset) {
                Ok(instruction) => {
                    let _ = writeln!(
                        &mut out,
                        "  {offset:04}: {}",
                        render_instruction(module, &instruction)
                    );
                    offset += instruction.len;
                }
                Err(fault) => {
                    let _ = writeln!(&mut out, "  {offset:04}: <invalid {fault:?}>");
                    break;
                }
            }
        }
        let _ = writeln!(&mut out, "}}");
    }
    out
}

fn render_instruction(module: &Module, instruction: &DecodedInstruction) -> String {
    let mut text = instruction.opcode.mnemonic().to_string();
    if let Some((_, width)) = instruction.operands.first()
        && *width != Width::Word
        && !instruction.operands.iter().any(|(operand, _)| operand.is_memory())
    {
        text.push(' ');
        text.push_str(width.keyword());
    }
    let end = instruction.offset + instruction.len;
    let rendered: Vec<String> = instruction
        .operands
        .iter()
        .map(|(operand, width)| match *operand {
            Operand::Immediate(value) if instruction.opcode.is_jump() => {
                format!("{value:+} ; -> {}", end as i64 + value)
            }
            Operand::Immediate(value)
                if matches!(instruction.opcode, OpCode::Call | OpCode::Syscall) =>
            {
                let name = decode_function_index(value)
                    .and_then(|(position, _)| module.functions.get(position))
                    .map(|entry| entry.name.as_str())
                    .unwrap_or("?");
                format!("%{name}")
            }
            Operand::Immediate(value) => value.to_string(),
            Operand::Register(register) => register.name().to_string(),
            Operand::Indirect { base, displacement } => {
                if displacement == 0 {
                    format!("[{} {}]", width.keyword(), base.name())
                } else {
                    format!("[{} {}{:+}]", width.keyword(), base.name(), displacement)
                }
            }
        })
        .collect();
    if !rendered.is_empty() {
        text.push(' ');
        text.push_str(&rendered.join(", "));
    }
    if let Some(argc) = instruction.argc {
        let _ = write!(&mut text, ", {argc}");
    }
    text
}

fn hex_preview(bytes: &[u8]) -> String {
    let mut out = String::new();
    for byte in bytes.iter().take(16) {
        let _ = write!(&mut out, "{byte:02x} ");
    }
    if bytes.len() > 16 {
        out.push_str("...");
    }
    out.trim_end().to_string()
}

fn write_u32_len(field: &'static str, len: usize, out: &mut Vec<u8>) -> Result<(), WireError> {
    let len = u32::try_from(len).map_err(|_| WireError::LengthTooLarge(field, len))?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_bytes(field: &'static str, bytes: &[u8], out: &mut Vec<u8>) -> Result<(), WireError> {
    write_u32_len(field, bytes.len(), out)?;
    out.extend_from_slice(bytes);
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let value = self
            .bytes
            .get(self.offset)
            .ok_or(WireError::UnexpectedEof)?;
        self.offset += 1;
        Ok(*value)
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.read_exact_array::<2>()?))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.read_exact_array::<4>()?))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32()? as usize;
        self.read_exact(len)
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn read_exact_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let bytes = self.read_exact(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(WireError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn is_eof(&self) -> bool {
        self.offset == self.bytes.len()
    }
}
