use anyhow::Context;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::OpenOptions;
use std::path::Path;

/// Where adapter diagnostics go. Stdout carries the protocol, so it is never a choice here.
#[derive(Debug, Clone, Default)]
pub struct LogConfig<'a> {
    /// Append records to this file instead of stderr.
    pub file: Option<&'a Path>,
    /// Overrides the `RUST_LOG` filter when set.
    pub level: Option<LevelFilter>,
}

/// Install the global logger.
pub fn init(config: LogConfig) -> anyhow::Result<()> {
    let mut builder = Builder::from_default_env();
    if let Some(level) = config.level {
        builder.filter_level(level);
    }

    match config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            builder.target(Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(Target::Stderr);
        }
    }

    builder.try_init().context("install logger")?;
    Ok(())
}
