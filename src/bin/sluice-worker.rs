//! The per-node worker executable.
//!
//! Usage: `sluice-worker <typed-program.json>`, with the ring-buffer and
//! reporting contract passed through environment variables (see
//! `sluice::runtime::worker`). Exits non-zero on any fatal startup
//! error; a healthy worker runs until the supervisor terminates it.

use anyhow::{bail, Context};
use sluice::runtime::worker::{run, WorkerConfig};
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args_os().skip(1);
    let program_path = match args.next() {
        Some(p) => PathBuf::from(p),
        None => bail!("usage: sluice-worker <typed-program.json>"),
    };
    let config = WorkerConfig::from_env(program_path).context("reading the worker environment")?;
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if config.debug { "debug" } else { "info" }),
    )
    .init();
    run(config).context("worker failed")?;
    Ok(())
}
