use crate::bytecode::OpCode;

use super::{Vm, VmError};

pub fn render_vm_error(vm: &Vm, err: &VmError) -> String {
    let mut out = format!("runtime error ({}): {err}", err.status_code());
    let ip = vm.ip();
    match vm.function_at(ip) {
        Some((name, offset)) => {
            out.push_str(&format!("\nat ip {ip:#x} (%{name}+{offset})"));
            if let Some(opcode) = vm
                .memory(ip, 1)
                .ok()
                .and_then(|bytes| bytes.first().copied())
                .and_then(OpCode::from_u8)
            {
                out.push_str(&format!("\n  | {}", opcode.mnemonic()));
            }
        }
        None => out.push_str(&format!("\nat ip {ip:#x}")),
    }
    out
}
