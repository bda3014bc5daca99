use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::bytecode::{Register, Width};
use crate::wire::{FunctionBody, Module, WireError, decode_function_index, decode_module};

pub(crate) mod builtin_runtime;
pub mod diagnostics;
mod exec;
pub mod memory;
pub mod native;
pub mod registers;

pub use memory::{Layout, Memory};
pub use native::{Native, NativeInfo, NativeRegistry, StaticNative};
pub use registers::{RegisterFile, Slot};

pub const ENTRY_POINT: &str = "main";
pub const DEFAULT_MAX_ARENA_SIZE: usize = 64 * 1024 * 1024;

/// Return address pushed for frames entered from the host; popping it ends the host call.
const HOST_RETURN: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    UnknownOpcode { opcode: u8, address: u64 },
    OutOfBoundsAccess { address: u64, len: usize, arena: usize },
    DivisionByZero,
    UndefinedFunction(i64),
    InstructionLimit(u64),
    InvalidRegister(u8),
    InvalidAddressingMode(u8),
    InvalidInstructionPointer(u64),
    Native(String),
    MissingFunction(String),
    MissingGlobal(String),
    GlobalSizeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    NotLoaded,
    NotRunnable,
    NativesFrozen,
}

impl VmError {
    /// Negative status reported to hosts that want a C-style exit code. Never 0.
    pub fn status_code(&self) -> i32 {
        match self {
            VmError::UnknownOpcode { .. } => -1,
            VmError::OutOfBoundsAccess { .. } => -2,
            VmError::DivisionByZero => -3,
            VmError::UndefinedFunction(_) => -4,
            VmError::InstructionLimit(_) => -5,
            VmError::InvalidRegister(_) => -6,
            VmError::InvalidAddressingMode(_) => -7,
            VmError::InvalidInstructionPointer(_) => -8,
            VmError::Native(_) => -9,
            VmError::MissingFunction(_) => -10,
            VmError::MissingGlobal(_) => -11,
            VmError::GlobalSizeMismatch { .. } => -12,
            VmError::NotLoaded => -13,
            VmError::NotRunnable => -14,
            VmError::NativesFrozen => -15,
        }
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::UnknownOpcode { opcode, address } => {
                write!(f, "unknown opcode {opcode:#04x} at {address}")
            }
            VmError::OutOfBoundsAccess {
                address,
                len,
                arena,
            } => write!(
                f,
                "out-of-bounds access of {len} bytes at {address:#x} (arena is {arena} bytes)"
            ),
            VmError::DivisionByZero => write!(f, "division by zero"),
            VmError::UndefinedFunction(index) => write!(f, "call to undefined function {index}"),
            VmError::InstructionLimit(limit) => {
                write!(f, "instruction budget of {limit} exhausted")
            }
            VmError::InvalidRegister(id) => write!(f, "invalid register id {id}"),
            VmError::InvalidAddressingMode(mode) => {
                write!(f, "invalid addressing mode {mode:#04x}")
            }
            VmError::InvalidInstructionPointer(ip) => {
                write!(f, "instruction pointer {ip:#x} outside text segment")
            }
            VmError::Native(message) => write!(f, "native error: {message}"),
            VmError::MissingFunction(name) => write!(f, "no script function named '{name}'"),
            VmError::MissingGlobal(name) => write!(f, "no global named '{name}'"),
            VmError::GlobalSizeMismatch {
                name,
                expected,
                got,
            } => write!(
                f,
                "global '{name}' holds {expected} bytes, got {got}"
            ),
            VmError::NotLoaded => write!(f, "no module loaded"),
            VmError::NotRunnable => write!(f, "engine faulted; reset or reload before running"),
            VmError::NativesFrozen => {
                write!(f, "natives must be registered before a module is loaded")
            }
        }
    }
}

impl std::error::Error for VmError {}

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    Wire(WireError),
    UnresolvedNative(String),
    EmptyFunction(String),
    ArenaTooLarge { requested: usize, limit: usize },
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(err) => write!(f, "io error: {err}"),
            LoadError::Wire(err) => write!(f, "malformed module: {err}"),
            LoadError::UnresolvedNative(name) => {
                write!(f, "native '{name}' is not registered")
            }
            LoadError::EmptyFunction(name) => write!(f, "function '{name}' has no code"),
            LoadError::ArenaTooLarge { requested, limit } => write!(
                f,
                "module needs a {requested} byte arena, limit is {limit}"
            ),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io(err) => Some(err),
            LoadError::Wire(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::Io(err)
    }
}

impl From<WireError> for LoadError {
    fn from(err: WireError) -> Self {
        LoadError::Wire(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    Unloaded,
    Ready,
    Running,
    Halted,
    Faulted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Runaway guard: faults with `InstructionLimit` once this many instructions ran.
    pub max_instructions: Option<u64>,
    pub force_safe_mode: bool,
    pub force_debug_mode: bool,
    pub max_arena_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_instructions: None,
            force_safe_mode: false,
            force_debug_mode: false,
            max_arena_size: DEFAULT_MAX_ARENA_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VmMetrics {
    pub memory_size: usize,
    pub stack_size: usize,
    pub data_size: usize,
    pub text_size: usize,
    pub instructions_executed: u64,
    pub max_instructions: Option<u64>,
    pub functions: usize,
    pub natives: usize,
    pub globals: usize,
    pub safe_mode: bool,
    pub debug_mode: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FunctionTarget {
    Script { entry: usize, len: usize },
    Native { slot: usize },
}

struct LoadedFunction {
    name: String,
    target: FunctionTarget,
}

struct LoadedGlobal {
    name: String,
    offset: usize,
    initial: Vec<u8>,
}

struct Image {
    memory: Memory,
    layout: Layout,
    functions: Vec<LoadedFunction>,
    function_names: HashMap<String, usize>,
    globals: Vec<LoadedGlobal>,
    global_names: HashMap<String, usize>,
    safe_mode: bool,
    debug_mode: bool,
}

impl Image {
    fn global(&self, name: &str) -> Option<&LoadedGlobal> {
        self.global_names
            .get(name)
            .and_then(|&index| self.globals.get(index))
    }

    fn restore_globals(&mut self) {
        for global in &self.globals {
            self.memory.fill(global.offset, &global.initial);
        }
    }
}

/// One engine instance: a native registry, at most one loaded module and its arena.
pub struct Vm {
    config: VmConfig,
    natives: NativeRegistry,
    image: Option<Image>,
    registers: RegisterFile,
    flag: bool,
    state: VmState,
    last_error: Option<VmError>,
    instructions: u64,
    call_depth: usize,
    args: Vec<String>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            config,
            natives: NativeRegistry::new(),
            image: None,
            registers: RegisterFile::new(),
            flag: false,
            state: VmState::Unloaded,
            last_error: None,
            instructions: 0,
            call_depth: 0,
            args: Vec::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn set_max_instructions(&mut self, limit: Option<u64>) {
        self.config.max_instructions = limit;
    }

    /// Adds `{name, callback}` pairs. Only allowed before the first load.
    pub fn register_natives(
        &mut self,
        natives: impl IntoIterator<Item = NativeInfo>,
    ) -> VmResult<()> {
        if self.image.is_some() {
            return Err(VmError::NativesFrozen);
        }
        for native in natives {
            debug!(name = %native.name, "registering native");
            self.natives.register(native);
        }
        Ok(())
    }

    pub fn register_native(&mut self, native: NativeInfo) -> VmResult<()> {
        self.register_natives([native])
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "loading module file");
        self.load_bytes(&bytes)
    }

    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), LoadError> {
        let module = decode_module(bytes)?;
        self.load_module(&module)
    }

    /// Builds the complete image first; on any error the engine is left untouched.
    pub fn load_module(&mut self, module: &Module) -> Result<(), LoadError> {
        let image = self.build_image(module)?;
        debug!(
            arena = image.memory.len(),
            functions = image.functions.len(),
            globals = image.globals.len(),
            safe_mode = image.safe_mode,
            "module loaded"
        );
        self.image = Some(image);
        self.registers.clear();
        self.flag = false;
        self.state = VmState::Ready;
        self.last_error = None;
        self.instructions = 0;
        self.call_depth = 0;
        Ok(())
    }

    fn build_image(&self, module: &Module) -> Result<Image, LoadError> {
        let mut text_size = 0usize;
        for function in &module.functions {
            match &function.body {
                FunctionBody::Native => {
                    if self.natives.slot(&function.name).is_none() {
                        return Err(LoadError::UnresolvedNative(function.name.clone()));
                    }
                }
                FunctionBody::Script(code) => {
                    if code.is_empty() {
                        return Err(LoadError::EmptyFunction(function.name.clone()));
                    }
                    text_size = text_size.saturating_add(code.len());
                }
            }
        }

        let stack_size = module.stack_size as usize;
        let global_sizes = module.globals.iter().map(|global| global.data.len());
        let requested = stack_size
            .saturating_add(module.globals.iter().map(|g| g.data.len() + 8).sum::<usize>())
            .saturating_add(text_size)
            .saturating_add(8);
        if requested > self.config.max_arena_size {
            return Err(LoadError::ArenaTooLarge {
                requested,
                limit: self.config.max_arena_size,
            });
        }
        let layout = Layout::new(stack_size, global_sizes, text_size);

        let safe_mode = module.safe_mode() || self.config.force_safe_mode;
        let debug_mode = module.debug_mode() || self.config.force_debug_mode;
        let mut memory = Memory::new(layout.total_size(), safe_mode);

        let mut globals = Vec::with_capacity(module.globals.len());
        let mut global_names = HashMap::new();
        for (global, &offset) in module.globals.iter().zip(&layout.global_offsets) {
            memory.fill(offset, &global.data);
            global_names.insert(global.name.clone(), globals.len());
            globals.push(LoadedGlobal {
                name: global.name.clone(),
                offset,
                initial: global.data.clone(),
            });
        }

        let mut functions = Vec::with_capacity(module.functions.len());
        let mut function_names = HashMap::new();
        let mut cursor = layout.text_base;
        for function in &module.functions {
            let target = match &function.body {
                FunctionBody::Native => FunctionTarget::Native {
                    slot: self
                        .natives
                        .slot(&function.name)
                        .ok_or_else(|| LoadError::UnresolvedNative(function.name.clone()))?,
                },
                FunctionBody::Script(code) => {
                    memory.fill(cursor, code);
                    let target = FunctionTarget::Script {
                        entry: cursor,
                        len: code.len(),
                    };
                    cursor += code.len();
                    target
                }
            };
            function_names.insert(function.name.clone(), functions.len());
            functions.push(LoadedFunction {
                name: function.name.clone(),
                target,
            });
        }

        Ok(Image {
            memory,
            layout,
            functions,
            function_names,
            globals,
            global_names,
            safe_mode,
            debug_mode,
        })
    }

    pub fn set_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Runs `main` from a zeroed register file and returns the accumulator's low 32 bits.
    ///
    /// The run ends at `halt` or at a `ret` from `main`. A fault moves the engine to
    /// [`VmState::Faulted`]; [`Vm::fault_code`] then reports the error's negative status.
    pub fn run(&mut self) -> VmResult<i32> {
        if self.state == VmState::Faulted {
            return Err(VmError::NotRunnable);
        }
        let entry = self.script_entry(ENTRY_POINT)?;
        self.registers.clear();
        self.flag = false;
        self.call_depth = 0;
        self.instructions = 0;
        self.registers.set_ip(entry as u64);
        self.state = VmState::Running;
        debug!(entry, "run started");

        let result = self.execute();
        self.finish(result)?;
        let code = self.registers.get(Register::ACCUMULATOR).as_i32();
        debug!(code, instructions = self.instructions, "run halted");
        Ok(code)
    }

    /// Calls a script function by name. Arguments are whatever the host pushed with
    /// [`Vm::push_value`]; they stay on the stack for the host to pop. Returns the accumulator.
    ///
    /// A call from the host starts a fresh instruction budget; a call made by a native during a
    /// run keeps counting against the run's budget.
    pub fn call_function(&mut self, name: &str) -> VmResult<Slot> {
        if self.state == VmState::Faulted {
            return Err(VmError::NotRunnable);
        }
        let entry = self.script_entry(name)?;
        let saved_state = self.state;
        let saved_depth = self.call_depth;
        let saved_ip = self.registers.ip();
        if saved_state != VmState::Running {
            self.instructions = 0;
        }

        self.push_value(Slot::from_u64(HOST_RETURN))?;
        self.push_value(Slot::from_u64(self.registers.bp()))?;
        self.registers.set_bp(self.registers.sp());
        self.registers.set_ip(entry as u64);
        self.call_depth = 1;
        self.state = VmState::Running;

        let result = self.execute();
        self.finish(result)?;
        self.call_depth = saved_depth;
        self.registers.set_ip(saved_ip);
        if saved_state == VmState::Running {
            self.state = VmState::Running;
        }
        Ok(self.registers.get(Register::ACCUMULATOR))
    }

    fn finish(&mut self, result: VmResult<()>) -> VmResult<()> {
        match result {
            Ok(()) => {
                self.state = VmState::Halted;
                Ok(())
            }
            Err(err) => {
                warn!(
                    status = err.status_code(),
                    ip = self.registers.ip(),
                    "engine faulted: {err}"
                );
                self.state = VmState::Faulted;
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Pushes one 8-byte value. Always bounds checked.
    pub fn push_value(&mut self, value: Slot) -> VmResult<()> {
        let sp = self.registers.sp();
        let image = self.image.as_mut().ok_or(VmError::NotLoaded)?;
        image
            .memory
            .slice_mut(sp, Width::Word.bytes())?
            .copy_from_slice(&value.bits().to_le_bytes());
        self.registers.set_sp(sp.wrapping_add(Width::Word.bytes() as u64));
        Ok(())
    }

    /// Pops one 8-byte value. Always bounds checked.
    pub fn pop_value(&mut self) -> VmResult<Slot> {
        let sp = self.registers.sp().wrapping_sub(Width::Word.bytes() as u64);
        let image = self.image.as_ref().ok_or(VmError::NotLoaded)?;
        let bytes = image.memory.slice(sp, Width::Word.bytes())?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        self.registers.set_sp(sp);
        Ok(Slot::from_bits(u64::from_le_bytes(raw)))
    }

    pub fn global(&self, name: &str) -> Option<&[u8]> {
        let image = self.image.as_ref()?;
        let global = image.global(name)?;
        image
            .memory
            .slice(global.offset as u64, global.initial.len())
            .ok()
    }

    pub fn global_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        let image = self.image.as_mut()?;
        let index = *image.global_names.get(name)?;
        let global = image.globals.get(index)?;
        let (offset, len) = (global.offset as u64, global.initial.len());
        image.memory.slice_mut(offset, len).ok()
    }

    pub fn global_address(&self, name: &str) -> Option<u64> {
        let image = self.image.as_ref()?;
        image.global(name).map(|global| global.offset as u64)
    }

    /// Copies host bytes into a global. The length must match the declared size.
    pub fn bind_global(&mut self, name: &str, data: &[u8]) -> VmResult<()> {
        let slot = self
            .global_mut(name)
            .ok_or_else(|| VmError::MissingGlobal(name.to_string()))?;
        if slot.len() != data.len() {
            return Err(VmError::GlobalSizeMismatch {
                name: name.to_string(),
                expected: slot.len(),
                got: data.len(),
            });
        }
        slot.copy_from_slice(data);
        Ok(())
    }

    /// Bounds-checked view of `len` arena bytes, valid until the engine is touched again.
    pub fn memory(&self, address: u64, len: usize) -> VmResult<&[u8]> {
        self.image
            .as_ref()
            .ok_or(VmError::NotLoaded)?
            .memory
            .slice(address, len)
    }

    pub fn memory_mut(&mut self, address: u64, len: usize) -> VmResult<&mut [u8]> {
        self.image
            .as_mut()
            .ok_or(VmError::NotLoaded)?
            .memory
            .slice_mut(address, len)
    }

    /// NUL-terminated byte string starting at `address` (terminator excluded).
    pub fn read_c_str(&self, address: u64) -> VmResult<&[u8]> {
        self.image
            .as_ref()
            .ok_or(VmError::NotLoaded)?
            .memory
            .c_str(address)
    }

    /// Zeroes registers and the stack, restores every global's initial bytes and clears a fault.
    pub fn reset(&mut self) {
        if let Some(image) = self.image.as_mut() {
            image.memory.zero(0, image.layout.data_base);
            image.restore_globals();
            self.state = VmState::Ready;
        }
        self.registers.clear();
        self.flag = false;
        self.last_error = None;
        self.instructions = 0;
        self.call_depth = 0;
    }

    pub fn metrics(&self) -> VmMetrics {
        let image = self.image.as_ref();
        let count = |native: bool| {
            image.map_or(0, |image| {
                image
                    .functions
                    .iter()
                    .filter(|function| {
                        matches!(function.target, FunctionTarget::Native { .. }) == native
                    })
                    .count()
            })
        };
        VmMetrics {
            memory_size: image.map_or(0, |image| image.memory.len()),
            stack_size: image.map_or(0, |image| image.layout.stack_size),
            data_size: image.map_or(0, |image| image.layout.data_size),
            text_size: image.map_or(0, |image| image.layout.text_size),
            instructions_executed: self.instructions,
            max_instructions: self.config.max_instructions,
            functions: count(false),
            natives: count(true),
            globals: image.map_or(0, |image| image.globals.len()),
            safe_mode: image.is_some_and(|image| image.safe_mode),
            debug_mode: image.is_some_and(|image| image.debug_mode),
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// 0 unless the engine is faulted.
    pub fn fault_code(&self) -> i32 {
        self.last_error.as_ref().map_or(0, VmError::status_code)
    }

    pub fn last_error(&self) -> Option<&VmError> {
        self.last_error.as_ref()
    }

    pub fn register(&self, register: Register) -> Slot {
        self.registers.get(register)
    }

    pub fn set_register(&mut self, register: Register, value: Slot) {
        self.registers.set(register, value);
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn ip(&self) -> u64 {
        self.registers.ip()
    }

    /// Condition flag written by comparisons.
    pub fn flag(&self) -> bool {
        self.flag
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions
    }

    pub fn call_depth(&self) -> usize {
        self.call_depth
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.image.as_ref().map(|image| &image.layout)
    }

    /// Script function containing `address`, with the offset into its body.
    pub fn function_at(&self, address: u64) -> Option<(&str, usize)> {
        let image = self.image.as_ref()?;
        image.functions.iter().find_map(|function| match function.target {
            FunctionTarget::Script { entry, len }
                if address >= entry as u64 && address < (entry + len) as u64 =>
            {
                Some((function.name.as_str(), (address - entry as u64) as usize))
            }
            _ => None,
        })
    }

    pub fn dump_registers(&self) -> String {
        let mut out = String::new();
        for (register, slot) in self.registers.iter() {
            let _ = writeln!(
                &mut out,
                "{:<4}= {:#018x} ({})",
                register.name(),
                slot.bits(),
                slot.as_i64()
            );
        }
        let _ = writeln!(&mut out, "flag= {}", self.flag);
        out
    }

    /// Stack words from the bottom of the stack up to `rsp`.
    pub fn dump_stack(&self) -> String {
        let mut out = String::new();
        let Some(image) = self.image.as_ref() else {
            return out;
        };
        let top = (self.registers.sp() as usize).min(image.layout.stack_size);
        for address in (0..top).step_by(Width::Word.bytes()) {
            let len = Width::Word.bytes().min(top - address);
            if let Ok(bytes) = image.memory.slice(address as u64, len) {
                let mut raw = [0u8; 8];
                raw[..len].copy_from_slice(bytes);
                let _ = writeln!(&mut out, "{address:06x}: {:#018x}", u64::from_le_bytes(raw));
            }
        }
        out
    }

    pub fn dump_globals(&self) -> String {
        let mut out = String::new();
        let Some(image) = self.image.as_ref() else {
            return out;
        };
        for global in &image.globals {
            let bytes = image
                .memory
                .slice(global.offset as u64, global.initial.len())
                .unwrap_or(&[]);
            let _ = write!(&mut out, "{} @{:#x}:", global.name, global.offset);
            for byte in bytes {
                let _ = write!(&mut out, " {byte:02x}");
            }
            out.push('\n');
        }
        out
    }

    fn image(&self) -> VmResult<&Image> {
        self.image.as_ref().ok_or(VmError::NotLoaded)
    }

    fn image_mut(&mut self) -> VmResult<&mut Image> {
        self.image.as_mut().ok_or(VmError::NotLoaded)
    }

    fn script_entry(&self, name: &str) -> VmResult<usize> {
        let image = self.image()?;
        let function = image
            .function_names
            .get(name)
            .and_then(|&index| image.functions.get(index))
            .ok_or_else(|| VmError::MissingFunction(name.to_string()))?;
        match function.target {
            FunctionTarget::Script { entry, .. } => Ok(entry),
            FunctionTarget::Native { .. } => Err(VmError::MissingFunction(name.to_string())),
        }
    }

    fn resolve_function(&self, index: i64) -> VmResult<FunctionTarget> {
        let image = self.image()?;
        let (position, native) =
            decode_function_index(index).ok_or(VmError::UndefinedFunction(index))?;
        let function = image
            .functions
            .get(position)
            .ok_or(VmError::UndefinedFunction(index))?;
        let is_native = matches!(function.target, FunctionTarget::Native { .. });
        if is_native != native {
            return Err(VmError::UndefinedFunction(index));
        }
        Ok(function.target)
    }
}
