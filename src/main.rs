//! tether - Debug Adapter Protocol server.
//!
//! Speaks DAP over stdin/stdout with a single client and drives native debuggees
//! through the ptrace backend.

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tether::backend::process::{self, ProcessBackend};
use tether::dap::tracer::FileTracer;
use tether::log::LogConfig;
use tether::session::{Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Append adapter diagnostics to this file instead of stderr.
    #[clap(long, env = "TETHER_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace), overrides RUST_LOG.
    #[clap(long, env = "TETHER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long)]
    trace_dap: bool,

    /// Upper bound of every debug backend call, in milliseconds.
    #[clap(long, env = "TETHER_REQUEST_TIMEOUT", default_value_t = 5000)]
    request_timeout: u64,

    /// How long teardown waits for debuggee output, in milliseconds.
    #[clap(long, env = "TETHER_DRAIN_TIMEOUT", default_value_t = 2000)]
    drain_timeout: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = args
        .log_level
        .as_deref()
        .map(LevelFilter::from_str)
        .transpose()
        .context("invalid --log-level")?;
    tether::log::init(LogConfig {
        file: args.log_file.as_deref(),
        level,
    })?;

    let tracer = match (&args.log_file, args.trace_dap) {
        (Some(path), true) => Some(FileTracer::new(path)?),
        (None, true) => {
            log::warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
            None
        }
        _ => None,
    };

    process::probe().context("debug backend is not usable")?;

    let request_timeout = Duration::from_millis(args.request_timeout);
    let config = SessionConfig {
        request_timeout,
        drain_timeout: Duration::from_millis(args.drain_timeout),
        tracer,
    };
    let backend = Arc::new(ProcessBackend::new(request_timeout));

    log::info!(target: "dap", "tether {} serving on stdio", env!("CARGO_PKG_VERSION"));
    Session::new(backend, config)
        .run(io::stdin(), io::stdout())
        .context("session ended with error")?;
    Ok(())
}
