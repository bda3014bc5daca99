use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::sync::Mutex;

use crate::builtins::{CapturedOutput, StdNative};

use super::{Slot, Vm, VmError, VmResult};

const STDOUT_HANDLE: i64 = 1;
const STDERR_HANDLE: i64 = 2;
const FIRST_FILE_HANDLE: i64 = 3;

pub(crate) enum Console {
    Stdout,
    Captured(CapturedOutput),
}

pub(crate) struct IoState {
    console: Console,
    next_handle: i64,
    handles: HashMap<i64, IoHandle>,
}

struct IoHandle {
    file: std::fs::File,
    eof: bool,
}

impl IoState {
    pub(crate) fn stdout() -> Self {
        Self::with_console(Console::Stdout)
    }

    pub(crate) fn captured(output: CapturedOutput) -> Self {
        Self::with_console(Console::Captured(output))
    }

    fn with_console(console: Console) -> Self {
        Self {
            console,
            next_handle: FIRST_FILE_HANDLE,
            handles: HashMap::new(),
        }
    }

    fn print(&mut self, bytes: &[u8]) -> VmResult<()> {
        match &self.console {
            Console::Stdout => {
                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(bytes)
                    .and_then(|_| stdout.flush())
                    .map_err(|err| host_error(format!("stdout write failed: {err}")))
            }
            Console::Captured(buffer) => {
                buffer
                    .lock()
                    .map_err(|_| host_error("captured output poisoned"))?
                    .extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    fn insert(&mut self, file: std::fs::File) -> i64 {
        let id = self.next_handle;
        self.next_handle = self.next_handle.saturating_add(1);
        self.handles.insert(id, IoHandle { file, eof: false });
        id
    }

    fn handle_mut(&mut self, id: i64) -> VmResult<&mut IoHandle> {
        self.handles
            .get_mut(&id)
            .ok_or_else(|| host_error(format!("file handle {id} is not open")))
    }

    /// Writes to a file handle, or to the console for the two standard handles.
    fn write_handle(&mut self, id: i64, bytes: &[u8]) -> VmResult<()> {
        match id {
            STDOUT_HANDLE => self.print(bytes),
            STDERR_HANDLE => std::io::stderr()
                .write_all(bytes)
                .map_err(|err| host_error(format!("stderr write failed: {err}"))),
            _ => self
                .handle_mut(id)?
                .file
                .write_all(bytes)
                .map_err(|err| host_error(format!("write to handle {id} failed: {err}"))),
        }
    }
}

pub(crate) fn execute_builtin_call(
    vm: &mut Vm,
    state: &Mutex<IoState>,
    native: StdNative,
    args: &[Slot],
    ret: &mut Slot,
) -> VmResult<()> {
    if args.len() < native.arity() {
        return Err(host_error(format!(
            "{} expects {} argument(s), got {}",
            native.name(),
            native.arity(),
            args.len()
        )));
    }
    let mut io = state
        .lock()
        .map_err(|_| host_error("stdio state poisoned"))?;
    *ret = match native {
        StdNative::Puts => builtin_puts(vm, &mut io, args)?,
        StdNative::Putchar => {
            let byte = args[0].as_u64() as u8;
            io.print(&[byte])?;
            Slot::from_u64(byte as u64)
        }
        StdNative::Printf => builtin_printf(vm, &mut io, args)?,
        StdNative::PrintInt => {
            io.print(format!("{}\n", args[0].as_i64()).as_bytes())?;
            Slot::ZERO
        }
        StdNative::PrintFloat => {
            io.print(format!("{}\n", args[0].as_f64()).as_bytes())?;
            Slot::ZERO
        }
        StdNative::Fopen => builtin_fopen(vm, &mut io, args)?,
        StdNative::Fclose => {
            let closed = io.handles.remove(&args[0].as_i64());
            match closed {
                Some(mut handle) => match handle.file.flush() {
                    Ok(()) => Slot::ZERO,
                    Err(_) => Slot::from_i64(-1),
                },
                None => Slot::from_i64(-1),
            }
        }
        StdNative::Fputs => {
            let text = vm.read_c_str(args[0].as_address())?.to_vec();
            io.write_handle(args[1].as_i64(), &text)?;
            Slot::ZERO
        }
        StdNative::Fputc => {
            let byte = args[0].as_u64() as u8;
            io.write_handle(args[1].as_i64(), &[byte])?;
            Slot::from_u64(byte as u64)
        }
        StdNative::Fgetc => {
            let handle = io.handle_mut(args[0].as_i64())?;
            let mut one = [0u8; 1];
            let read = handle
                .file
                .read(&mut one)
                .map_err(|err| host_error(format!("fgetc failed: {err}")))?;
            if read == 0 {
                handle.eof = true;
                Slot::from_i64(-1)
            } else {
                Slot::from_u64(one[0] as u64)
            }
        }
        StdNative::Fread => builtin_fread(vm, &mut io, args)?,
        StdNative::Fwrite => {
            let len = args[1].as_u64() as usize;
            let bytes = vm.memory(args[0].as_address(), len)?.to_vec();
            io.write_handle(args[2].as_i64(), &bytes)?;
            Slot::from_u64(len as u64)
        }
        StdNative::Fflush => {
            let id = args[0].as_i64();
            if id != STDOUT_HANDLE && id != STDERR_HANDLE {
                io.handle_mut(id)?
                    .file
                    .flush()
                    .map_err(|err| host_error(format!("fflush failed: {err}")))?;
            }
            Slot::ZERO
        }
        StdNative::Feof => Slot::from_bool(io.handle_mut(args[0].as_i64())?.eof),
        StdNative::Remove => {
            let path = c_string(vm, args[0])?;
            status(std::fs::remove_file(path).is_ok())
        }
        StdNative::Rename => {
            let from = c_string(vm, args[0])?;
            let to = c_string(vm, args[1])?;
            status(std::fs::rename(from, to).is_ok())
        }
        StdNative::Strlen => Slot::from_u64(vm.read_c_str(args[0].as_address())?.len() as u64),
        StdNative::Strcmp => {
            let lhs = vm.read_c_str(args[0].as_address())?;
            let rhs = vm.read_c_str(args[1].as_address())?;
            Slot::from_i64(match lhs.cmp(rhs) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            })
        }
        StdNative::Strcpy => {
            let mut text = vm.read_c_str(args[1].as_address())?.to_vec();
            text.push(0);
            vm.memory_mut(args[0].as_address(), text.len())?
                .copy_from_slice(&text);
            args[0]
        }
        StdNative::Memset => {
            let byte = args[1].as_u64() as u8;
            vm.memory_mut(args[0].as_address(), args[2].as_u64() as usize)?
                .fill(byte);
            args[0]
        }
        StdNative::Memcpy => {
            let len = args[2].as_u64() as usize;
            let bytes = vm.memory(args[1].as_address(), len)?.to_vec();
            vm.memory_mut(args[0].as_address(), len)?
                .copy_from_slice(&bytes);
            args[0]
        }
        StdNative::Argc => Slot::from_u64(vm.args().len() as u64),
        StdNative::Argv => builtin_argv(vm, args)?,
    };
    Ok(())
}

fn builtin_puts(vm: &mut Vm, io: &mut IoState, args: &[Slot]) -> VmResult<Slot> {
    let mut text = vm.read_c_str(args[0].as_address())?.to_vec();
    text.push(b'\n');
    io.print(&text)?;
    Ok(Slot::from_u64(text.len() as u64))
}

fn builtin_fopen(vm: &mut Vm, io: &mut IoState, args: &[Slot]) -> VmResult<Slot> {
    let path = c_string(vm, args[0])?;
    let mode = c_string(vm, args[1])?;

    let mut options = OpenOptions::new();
    match mode.trim_end_matches('b') {
        "r" => {
            options.read(true);
        }
        "w" => {
            options.write(true).create(true).truncate(true);
        }
        "a" => {
            options.append(true).create(true);
        }
        "r+" => {
            options.read(true).write(true);
        }
        "w+" => {
            options.read(true).write(true).create(true).truncate(true);
        }
        "a+" => {
            options.read(true).append(true).create(true);
        }
        other => {
            return Err(host_error(format!(
                "unsupported fopen mode '{other}', expected r/w/a/r+/w+/a+"
            )));
        }
    }
    // C semantics: a failed open yields a null handle rather than a fault.
    Ok(match options.open(&path) {
        Ok(file) => Slot::from_i64(io.insert(file)),
        Err(_) => Slot::ZERO,
    })
}

fn builtin_fread(vm: &mut Vm, io: &mut IoState, args: &[Slot]) -> VmResult<Slot> {
    let len = args[1].as_u64() as usize;
    let buffer = vm.memory_mut(args[0].as_address(), len)?;
    let handle = io.handle_mut(args[2].as_i64())?;
    let mut filled = 0;
    while filled < len {
        let read = handle
            .file
            .read(&mut buffer[filled..])
            .map_err(|err| host_error(format!("fread failed: {err}")))?;
        if read == 0 {
            handle.eof = true;
            break;
        }
        filled += read;
    }
    Ok(Slot::from_u64(filled as u64))
}

/// `argv(index, buffer, size)` copies the argument NUL-terminated and truncated to `size`.
fn builtin_argv(vm: &mut Vm, args: &[Slot]) -> VmResult<Slot> {
    let Some(arg) = usize::try_from(args[0].as_i64())
        .ok()
        .and_then(|index| vm.args().get(index))
        .cloned()
    else {
        return Ok(Slot::from_i64(-1));
    };
    let size = args[2].as_u64() as usize;
    if size == 0 {
        return Ok(Slot::from_u64(arg.len() as u64));
    }
    let copied = arg.len().min(size - 1);
    let dst = vm.memory_mut(args[1].as_address(), copied + 1)?;
    dst[..copied].copy_from_slice(&arg.as_bytes()[..copied]);
    dst[copied] = 0;
    Ok(Slot::from_u64(arg.len() as u64))
}

/// Supports `%d %i %u %x %c %s %f %%`; each conversion consumes the next argument.
fn builtin_printf(vm: &mut Vm, io: &mut IoState, args: &[Slot]) -> VmResult<Slot> {
    let format = vm.read_c_str(args[0].as_address())?.to_vec();
    let mut values = args[1..].iter().copied();
    let mut next = |spec: char| {
        values
            .next()
            .ok_or_else(|| host_error(format!("printf: missing argument for %{spec}")))
    };

    let mut out = Vec::with_capacity(format.len());
    let mut bytes = format.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            out.push(byte);
            continue;
        }
        let Some(spec) = bytes.next() else {
            out.push(b'%');
            break;
        };
        match spec {
            b'%' => out.push(b'%'),
            b'd' | b'i' => out.extend_from_slice(next('d')?.as_i64().to_string().as_bytes()),
            b'u' => out.extend_from_slice(next('u')?.as_u64().to_string().as_bytes()),
            b'x' => out.extend_from_slice(format!("{:x}", next('x')?.as_u64()).as_bytes()),
            b'c' => out.push(next('c')?.as_u64() as u8),
            b'f' => out.extend_from_slice(format!("{:.6}", next('f')?.as_f64()).as_bytes()),
            b's' => {
                let address = next('s')?.as_address();
                out.extend_from_slice(vm.read_c_str(address)?);
            }
            other => {
                out.push(b'%');
                out.push(other);
            }
        }
    }
    io.print(&out)?;
    Ok(Slot::from_u64(out.len() as u64))
}

fn c_string(vm: &Vm, slot: Slot) -> VmResult<String> {
    Ok(String::from_utf8_lossy(vm.read_c_str(slot.as_address())?).into_owned())
}

fn status(ok: bool) -> Slot {
    Slot::from_i64(if ok { 0 } else { -1 })
}

fn host_error(message: impl Into<String>) -> VmError {
    VmError::Native(message.into())
}
