use std::io;
use std::path::{Path, PathBuf};

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::{info, warn};
use vm::logging::{self, category_asm, category_native, category_run, status_label};
use vm::{
    MODULE_EXTENSION, Module, NativeInfo, Slot, Vm, VmConfig, VmResult, assemble, builtins,
    decode_module, disassemble_module, render_vm_error, validate_module,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CliConfig {
    source: Option<String>,
    safe: bool,
    debug: bool,
    max_instructions: Option<u64>,
    metrics: bool,
    disasm: bool,
    validate: bool,
    dump: bool,
    no_stdlib: bool,
    call: Option<String>,
    push: Vec<i64>,
    script_args: Vec<String>,
    repl: bool,
    help: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    logging::init(if cli.debug { "debug" } else { "info" })?;
    if cli.repl {
        return run_repl();
    }

    let source = cli
        .source
        .as_deref()
        .ok_or_else(|| io::Error::other("missing module or source path (see --help)"))?;
    let source_path = PathBuf::from(source);
    let module = load_module(&source_path)?;

    if cli.validate {
        validate_module(&module)?;
        println!("{}: ok", source_path.display());
        return Ok(());
    }
    if cli.disasm {
        print!("{}", disassemble_module(&module));
        return Ok(());
    }

    let config = VmConfig {
        max_instructions: cli.max_instructions,
        force_safe_mode: cli.safe,
        force_debug_mode: cli.debug,
        ..VmConfig::default()
    };
    let mut vm = Vm::with_config(config);
    vm.register_natives(host_natives())?;
    if !cli.no_stdlib {
        builtins::register(&mut vm)?;
    }
    vm.load_module(&module)?;

    let mut script_args = vec![source_path.display().to_string()];
    script_args.extend(cli.script_args.iter().cloned());
    vm.set_args(script_args);

    let outcome = match cli.call.as_deref() {
        Some(name) => call_with_pushed(&mut vm, name, &cli.push).map(|slot| slot.as_i64()),
        None => vm.run().map(i64::from),
    };

    if cli.dump {
        print!("{}", vm.dump_registers());
        print!("{}", vm.dump_stack());
        print!("{}", vm.dump_globals());
    }
    if cli.metrics {
        println!("{}", serde_json::to_string_pretty(&vm.metrics())?);
    }

    match outcome {
        Ok(result) => {
            info!(
                "{} result: {} ({} instructions)",
                category_run(),
                status_label(result as i32, false),
                vm.instructions_executed()
            );
            println!("result: {result}");
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", render_vm_error(&vm, &err));
            warn!(
                "{} status: {}",
                category_run(),
                status_label(vm.fault_code(), true)
            );
            std::process::exit(1);
        }
    }
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--safe" => {
                cfg.safe = true;
                index += 1;
            }
            "--debug" => {
                cfg.debug = true;
                index += 1;
            }
            "--metrics" => {
                cfg.metrics = true;
                index += 1;
            }
            "--disasm" => {
                cfg.disasm = true;
                index += 1;
            }
            "--validate" => {
                cfg.validate = true;
                index += 1;
            }
            "--dump" => {
                cfg.dump = true;
                index += 1;
            }
            "--repl" => {
                cfg.repl = true;
                index += 1;
            }
            "--no-stdlib" => {
                cfg.no_stdlib = true;
                index += 1;
            }
            "--max-instructions" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --max-instructions".to_string())?;
                let value = raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --max-instructions value '{raw}'"))?;
                cfg.max_instructions = Some(value);
                index += 2;
            }
            "--call" => {
                let name = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --call".to_string())?;
                cfg.call = Some(name.clone());
                index += 2;
            }
            "--push" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --push".to_string())?;
                let value = raw
                    .parse::<i64>()
                    .map_err(|_| format!("invalid --push value '{raw}'"))?;
                cfg.push.push(value);
                index += 2;
            }
            "--" => {
                cfg.script_args = args[index + 1..].to_vec();
                break;
            }
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            path => {
                if cfg.source.is_some() {
                    return Err("multiple source paths provided".to_string());
                }
                cfg.source = Some(path.to_string());
                index += 1;
            }
        }
    }

    Ok(cfg)
}

/// Compiled modules load as-is; anything else is assembled in memory first.
fn load_module(path: &Path) -> Result<Module, Box<dyn std::error::Error>> {
    let is_module = path
        .extension()
        .is_some_and(|extension| extension == MODULE_EXTENSION);
    if is_module {
        let bytes = std::fs::read(path)?;
        return Ok(decode_module(&bytes)?);
    }
    let text = std::fs::read_to_string(path)?;
    let module = assemble(&text)?;
    info!("{} assembled {}", category_asm(), path.display());
    Ok(module)
}

fn call_with_pushed(vm: &mut Vm, name: &str, values: &[i64]) -> VmResult<Slot> {
    for value in values.iter().rev() {
        vm.push_value(Slot::from_i64(*value))?;
    }
    let result = vm.call_function(name)?;
    for _ in values {
        vm.pop_value()?;
    }
    Ok(result)
}

/// Natives the runner always provides on top of the standard set.
fn host_natives() -> Vec<NativeInfo> {
    vec![
        NativeInfo::new("print_hello", |_vm, _args, _ret| {
            info!("{} hello from bytecode", category_native());
            Ok(())
        }),
        NativeInfo::new("inspect_player", |vm, args, _ret| {
            let Some(address) = args.first().map(|arg| arg.as_address()) else {
                warn!("{} inspect_player called without a pointer", category_native());
                return Ok(());
            };
            let bytes = vm.memory(address, 12)?;
            let field = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
            info!(
                "{} player speed: {} health: {} ammo: {}",
                category_native(),
                f32::from_le_bytes(field(0)),
                u32::from_le_bytes(field(4)),
                u32::from_le_bytes(field(8))
            );
            Ok(())
        }),
        NativeInfo::new("getglobal", |vm, _args, ret| {
            if let Some(bytes) = vm.global("i")
                && let Ok(raw) = <[u8; 4]>::try_from(&bytes[..bytes.len().min(4)])
            {
                let value = i32::from_le_bytes(raw);
                info!("{} global i == {value}", category_native());
                *ret = Slot::from_i64(value as i64);
            }
            Ok(())
        }),
    ]
}

fn print_usage() {
    println!("Usage: regvm [OPTIONS] <module.{MODULE_EXTENSION}|source.asm> [-- script args...]");
    println!();
    println!("Options:");
    println!("  --safe                    Bounds-check every memory access");
    println!("  --debug                   Trace every executed instruction");
    println!("  --max-instructions <N>    Fault after N instructions");
    println!("  --call <NAME>             Call NAME instead of running main");
    println!("  --push <INT>              Argument for --call (repeatable, first is nearest)");
    println!("  --metrics                 Print engine metrics as JSON after the run");
    println!("  --dump                    Print registers, stack and globals after the run");
    println!("  --disasm                  Print the module disassembly and exit");
    println!("  --validate                Check the module bytecode and exit");
    println!("  --no-stdlib               Do not register the standard natives");
    println!("  --repl                    Interactive session: each line extends main");
    println!("  -h, --help                Show this help");
}

/// Lines typed so far. Directives go above `main`, everything else into its body.
#[derive(Default)]
struct ReplSession {
    directives: Vec<String>,
    body: Vec<String>,
}

impl ReplSession {
    fn source(&self) -> String {
        let mut source = self.directives.join("\n");
        source.push_str("\n%main {\n");
        for line in &self.body {
            source.push_str(line);
            source.push('\n');
        }
        source.push_str("halt\n}\n");
        source
    }

    fn push(&mut self, line: &str) {
        if line.starts_with('$') {
            self.directives.push(line.to_string());
        } else {
            self.body.push(line.to_string());
        }
    }

    fn pop(&mut self, line: &str) {
        if line.starts_with('$') {
            self.directives.pop();
        } else {
            self.body.pop();
        }
    }
}

fn run_repl() -> Result<(), Box<dyn std::error::Error>> {
    println!("regvm REPL");
    println!("each line is appended to main and the program re-runs; .help lists commands");
    let mut editor = DefaultEditor::new()?;
    let mut session = ReplSession::default();
    loop {
        match editor.readline("regvm> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line {
                    ".quit" | ".exit" => break,
                    ".help" => {
                        println!("type an instruction (mov ra, 5) or a directive ($global n 8 0)");
                        println!(".list shows the program, .reset clears it, .quit leaves");
                        continue;
                    }
                    ".list" => {
                        print!("{}", session.source());
                        continue;
                    }
                    ".reset" => {
                        session = ReplSession::default();
                        continue;
                    }
                    _ => {}
                }
                let _ = editor.add_history_entry(line);
                session.push(line);
                let module = match assemble(&session.source()) {
                    Ok(module) => module,
                    Err(err) => {
                        println!("{err}");
                        session.pop(line);
                        continue;
                    }
                };
                let mut vm = Vm::new();
                vm.register_natives(host_natives())?;
                builtins::register(&mut vm)?;
                if let Err(err) = vm.load_module(&module) {
                    println!("{err}");
                    session.pop(line);
                    continue;
                }
                match vm.run() {
                    Ok(result) => {
                        println!("=> {result}");
                        print!("{}", vm.dump_registers());
                    }
                    Err(err) => println!("{}", render_vm_error(&vm, &err)),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("bye");
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_flags_and_script_args() {
        let cfg = parse_cli_args(&args(&[
            "--safe",
            "--max-instructions",
            "500",
            "prog.rbc",
            "--",
            "one",
            "--two",
        ]))
        .expect("parse");
        assert!(cfg.safe);
        assert_eq!(cfg.max_instructions, Some(500));
        assert_eq!(cfg.source.as_deref(), Some("prog.rbc"));
        assert_eq!(cfg.script_args, vec!["one".to_string(), "--two".to_string()]);
    }

    #[test]
    fn rejects_unknown_flags_and_second_source() {
        assert!(parse_cli_args(&args(&["--jit"])).is_err());
        assert!(parse_cli_args(&args(&["a.rbc", "b.rbc"])).is_err());
        assert!(parse_cli_args(&args(&["--max-instructions", "many"])).is_err());
    }

    #[test]
    fn repl_session_wraps_lines_in_main() {
        let mut session = ReplSession::default();
        session.push("$global n 8");
        session.push("mov ra, 7");
        let module = assemble(&session.source()).expect("assemble");
        assert_eq!(module.globals.len(), 1);
        let mut vm = Vm::new();
        vm.load_module(&module).expect("load");
        assert_eq!(vm.run().expect("run"), 7);

        session.pop("mov ra, 7");
        assert!(!session.source().contains("mov"));
    }
}
