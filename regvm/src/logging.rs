use owo_colors::OwoColorize;
use std::sync::OnceLock;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

/// Installs the process-wide subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init(default_filter: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ansi = detect_ansi();
    let _ = ANSI_ENABLED.set(ansi);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

pub fn category_asm() -> String {
    if ansi_enabled() {
        format!("{}", "ASM".bright_cyan().bold())
    } else {
        "ASM".to_string()
    }
}

pub fn category_run() -> String {
    if ansi_enabled() {
        format!("{}", "RUN".bright_green().bold())
    } else {
        "RUN".to_string()
    }
}

pub fn category_native() -> String {
    if ansi_enabled() {
        format!("{}", "NATIVE".bright_magenta().bold())
    } else {
        "NATIVE".to_string()
    }
}

/// Exit status of a run: 0 green, anything else yellow, engine faults red.
pub fn status_label(status: i32, faulted: bool) -> String {
    let text = status.to_string();
    if !ansi_enabled() {
        return text;
    }

    match (faulted, status) {
        (true, _) => format!("{}", text.bright_red()),
        (false, 0) => format!("{}", text.bright_green()),
        _ => format!("{}", text.bright_yellow()),
    }
}

fn ansi_enabled() -> bool {
    *ANSI_ENABLED.get_or_init(detect_ansi)
}

fn detect_ansi() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }

    if std::env::var_os("FORCE_COLOR").is_some() {
        let _ = enable_ansi_support();
        return true;
    }

    let windows_vt = enable_ansi_support().is_ok();
    windows_vt || supports_color::on_cached(Stream::Stderr).is_some()
}

#[cfg(windows)]
fn enable_ansi_support() -> windows::core::Result<()> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Console::{
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, GetConsoleMode, GetStdHandle, STD_ERROR_HANDLE,
        SetConsoleMode,
    };

    unsafe {
        let handle = GetStdHandle(STD_ERROR_HANDLE)?;
        if handle == HANDLE::default() {
            return Ok(());
        }

        let mut mode = std::mem::zeroed();
        GetConsoleMode(handle, &mut mode)?;
        SetConsoleMode(handle, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING)?;
        Ok(())
    }
}

#[cfg(not(windows))]
fn enable_ansi_support() -> Result<(), ()> {
    Err(())
}
