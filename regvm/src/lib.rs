pub mod assembler;
pub mod builtins;
pub mod bytecode;
#[cfg(feature = "cli")]
pub mod logging;
pub mod vm;
pub mod wire;

pub use assembler::{
    AsmError, AsmErrorKind, Assembler, Assembly, PcMark, assemble, assemble_file,
    assemble_with_trace, output_path,
};
pub use builtins::{CapturedOutput, StdNative};
pub use bytecode::{OpCode, Operand, Register, Width};
pub use vm::diagnostics::render_vm_error;
pub use vm::{
    ENTRY_POINT, Layout, LoadError, Native, NativeInfo, NativeRegistry, Slot, StaticNative, Vm,
    VmConfig, VmError, VmMetrics, VmResult, VmState,
};
pub use wire::{
    FunctionBody, FunctionEntry, GlobalEntry, MODULE_EXTENSION, Module, ValidationError,
    WireError, decode_module, disassemble_module, encode_module, validate_module,
};
