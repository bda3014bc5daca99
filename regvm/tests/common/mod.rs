#![allow(dead_code, unused_imports)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use vm::{
    CapturedOutput, Module, NativeInfo, Register, Slot, Vm, VmConfig, VmError, VmResult, VmState,
    assemble, builtins,
};

pub fn module(source: &str) -> Module {
    assemble(source).expect("assemble should succeed")
}

pub fn load(source: &str) -> Vm {
    load_with(source, Vec::new())
}

pub fn load_with(source: &str, natives: Vec<NativeInfo>) -> Vm {
    let mut vm = Vm::new();
    vm.register_natives(natives).expect("register natives");
    vm.load_module(&module(source)).expect("load should succeed");
    vm
}

pub fn run(source: &str) -> (Vm, VmResult<i32>) {
    let mut vm = load(source);
    let result = vm.run();
    (vm, result)
}

/// Engine with the standard natives writing into the returned buffer.
pub fn load_with_stdlib(source: &str) -> (Vm, CapturedOutput) {
    let output: CapturedOutput = Arc::new(Mutex::new(Vec::new()));
    let mut vm = Vm::new();
    builtins::register_with_output(&mut vm, Arc::clone(&output)).expect("register stdlib");
    vm.load_module(&module(source)).expect("load should succeed");
    (vm, output)
}

pub fn captured_text(output: &CapturedOutput) -> String {
    String::from_utf8_lossy(&output.lock().expect("output lock")).into_owned()
}

/// Unique scratch path under the system temp dir.
pub fn temp_path(stem: &str, extension: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "regvm-{stem}-{}-{id}.{extension}",
        std::process::id()
    ))
}
