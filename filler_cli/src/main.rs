#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod cli;
mod commands;
mod console;
mod error_fmt;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use eyre::{Result, WrapErr, eyre};
use filler_config::{Config, Logging, load_toml};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use crate::cli::{Cli, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: color-eyre not installed: {e}");
    }

    if let Err(err) = real_main(&cli) {
        tracing::error!(error = %err, "command failed");
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}

fn real_main(cli: &Cli) -> Result<()> {
    let cfg = load_config(&cli.config)?;
    // Dropped on return so the file sink flushes before the error is printed.
    let _file_guard = init_tracing(cli.json, &cli.log_level, &cfg.logging)?;
    tracing::debug!(config = %cli.config.display(), sim = cli.sim, "configuration loaded");

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
            .wrap_err("install Ctrl-C handler")?;
    }
    commands::dispatch(cli, &cfg, cancel)
}

fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    let cfg = load_toml(&text)
        .map_err(|e| eyre!("{e}"))
        .wrap_err("invalid configuration")?;
    cfg.validate().wrap_err("invalid configuration")?;
    Ok(cfg)
}

/// Console logs go to stderr so stdout stays free for prompts and results.
/// `RUST_LOG` overrides `--log-level`; the optional file sink always writes JSON lines.
fn init_tracing(json: bool, level: &str, logging: &Logging) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("invalid log level '{level}'"))?,
    };

    let console_layer = {
        let base = fmt::layer().with_writer(std::io::stderr).with_target(false);
        if json {
            base.json().with_filter(filter).boxed()
        } else {
            base.with_filter(filter).boxed()
        }
    };

    let mut guard = None;
    let file_layer = match logging.file.as_deref() {
        Some(file) => {
            let path = Path::new(file);
            let dir = path
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre!("logging.file '{file}' has no file name"))?;
            std::fs::create_dir_all(dir)
                .wrap_err_with(|| format!("create log directory {}", dir.display()))?;
            let appender = match logging.rotation.as_deref().unwrap_or("never") {
                "daily" => tracing_appender::rolling::daily(dir, name),
                "hourly" => tracing_appender::rolling::hourly(dir, name),
                _ => tracing_appender::rolling::never(dir, name),
            };
            let (writer, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            let file_level = logging.level.as_deref().unwrap_or("info");
            let file_filter = EnvFilter::try_new(file_level)
                .wrap_err_with(|| format!("invalid logging.level '{file_level}'"))?;
            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(file_filter)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| eyre!("init tracing: {e}"))?;
    Ok(guard)
}
