//! Standard native set: C-style stdio, string and argument helpers a script can declare with
//! `$native %name`. Hosts opt in with [`register`].

use std::sync::{Arc, Mutex};

use crate::vm::builtin_runtime::{IoState, execute_builtin_call};
use crate::vm::{NativeInfo, Vm, VmResult};

/// Buffer that receives everything the standard natives print when registered through
/// [`register_with_output`].
pub type CapturedOutput = Arc<Mutex<Vec<u8>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StdNative {
    Puts,
    Putchar,
    Printf,
    PrintInt,
    PrintFloat,
    Fopen,
    Fclose,
    Fputs,
    Fputc,
    Fgetc,
    Fread,
    Fwrite,
    Fflush,
    Feof,
    Remove,
    Rename,
    Strlen,
    Strcmp,
    Strcpy,
    Memset,
    Memcpy,
    Argc,
    Argv,
}

impl StdNative {
    pub const ALL: [StdNative; 23] = [
        StdNative::Puts,
        StdNative::Putchar,
        StdNative::Printf,
        StdNative::PrintInt,
        StdNative::PrintFloat,
        StdNative::Fopen,
        StdNative::Fclose,
        StdNative::Fputs,
        StdNative::Fputc,
        StdNative::Fgetc,
        StdNative::Fread,
        StdNative::Fwrite,
        StdNative::Fflush,
        StdNative::Feof,
        StdNative::Remove,
        StdNative::Rename,
        StdNative::Strlen,
        StdNative::Strcmp,
        StdNative::Strcpy,
        StdNative::Memset,
        StdNative::Memcpy,
        StdNative::Argc,
        StdNative::Argv,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StdNative::Puts => "puts",
            StdNative::Putchar => "putchar",
            StdNative::Printf => "printf",
            StdNative::PrintInt => "print_int",
            StdNative::PrintFloat => "print_float",
            StdNative::Fopen => "fopen",
            StdNative::Fclose => "fclose",
            StdNative::Fputs => "fputs",
            StdNative::Fputc => "fputc",
            StdNative::Fgetc => "fgetc",
            StdNative::Fread => "fread",
            StdNative::Fwrite => "fwrite",
            StdNative::Fflush => "fflush",
            StdNative::Feof => "feof",
            StdNative::Remove => "remove",
            StdNative::Rename => "rename",
            StdNative::Strlen => "strlen",
            StdNative::Strcmp => "strcmp",
            StdNative::Strcpy => "strcpy",
            StdNative::Memset => "memset",
            StdNative::Memcpy => "memcpy",
            StdNative::Argc => "argc",
            StdNative::Argv => "argv",
        }
    }

    /// Minimum argument count. `printf` takes any number of values after its format.
    pub fn arity(self) -> usize {
        match self {
            StdNative::Argc => 0,
            StdNative::Puts
            | StdNative::Putchar
            | StdNative::Printf
            | StdNative::PrintInt
            | StdNative::PrintFloat
            | StdNative::Fclose
            | StdNative::Fgetc
            | StdNative::Fflush
            | StdNative::Feof
            | StdNative::Remove
            | StdNative::Strlen => 1,
            StdNative::Fopen
            | StdNative::Fputs
            | StdNative::Fputc
            | StdNative::Rename
            | StdNative::Strcmp
            | StdNative::Strcpy => 2,
            StdNative::Fread
            | StdNative::Fwrite
            | StdNative::Memset
            | StdNative::Memcpy
            | StdNative::Argv => 3,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|native| native.name() == name)
    }
}

/// Registers the standard natives, printing to the process stdout.
pub fn register(vm: &mut Vm) -> VmResult<()> {
    vm.register_natives(natives(IoState::stdout()))
}

/// Registers the standard natives with console output appended to `output` instead of stdout.
pub fn register_with_output(vm: &mut Vm, output: CapturedOutput) -> VmResult<()> {
    vm.register_natives(natives(IoState::captured(output)))
}

fn natives(state: IoState) -> Vec<NativeInfo> {
    let state = Arc::new(Mutex::new(state));
    StdNative::ALL
        .into_iter()
        .map(|native| {
            let state = Arc::clone(&state);
            NativeInfo::new(native.name(), move |vm, args, ret| {
                execute_builtin_call(vm, &state, native, args, ret)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_and_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for native in StdNative::ALL {
            assert_eq!(StdNative::from_name(native.name()), Some(native));
            assert!(seen.insert(native.name()));
        }
        assert_eq!(StdNative::from_name("malloc"), None);
    }
}
