use std::io;
use std::path::PathBuf;

use tracing::{error, info};
use vm::logging::{self, category_asm};
use vm::{assemble_file, assemble_with_trace};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CliConfig {
    source: Option<String>,
    trace: bool,
    help: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    logging::init("info")?;

    let Some(source) = cli.source else {
        print_usage();
        std::process::exit(2);
    };
    let source = PathBuf::from(source);

    if cli.trace {
        let text = std::fs::read_to_string(&source)?;
        match assemble_with_trace(&text) {
            Ok(assembly) => {
                for (one, two) in assembly.pass_one.iter().zip(&assembly.pass_two) {
                    println!(
                        "line {:>4}  %{:<16} pass1 {:#06x}  pass2 {:#06x}",
                        one.line, one.function, one.pc, two.pc
                    );
                }
            }
            Err(err) => {
                eprintln!("{}: {err}", source.display());
                std::process::exit(1);
            }
        }
    }

    match assemble_file(&source) {
        Ok(output) => {
            info!(
                "{} {} -> {}",
                category_asm(),
                source.display(),
                output.display()
            );
            Ok(())
        }
        Err(err) => {
            eprintln!("{}: {err}", source.display());
            error!("{} assembly failed, no module written", category_asm());
            std::process::exit(1);
        }
    }
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => cfg.help = true,
            "--trace" => cfg.trace = true,
            value if value.starts_with('-') => return Err(format!("unknown flag '{value}'")),
            path => {
                if cfg.source.is_some() {
                    return Err("multiple source paths provided".to_string());
                }
                cfg.source = Some(path.to_string());
            }
        }
    }
    Ok(cfg)
}

fn print_usage() {
    println!("Usage: regvm-asm [--trace] <source.asm>");
    println!();
    println!("Writes the assembled module next to the source with its extension replaced.");
    println!("  --trace     Print the program counter of every instruction in both passes");
}
