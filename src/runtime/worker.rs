//! The worker process: one node, one runtime, ring buffers in and out.
//!
//! The supervisor spawns one worker per running node with the typed
//! program as argv[1] and the rest of the contract in environment
//! variables: `input_ringbuf` (empty for sources), `output_ringbufs_ref`
//! (a file listing one target ring buffer per line, re-read when its
//! mtime changes, so fan-out can change without a restart), `report_url`
//! and `debug`. Tuple processing is single-threaded; a helper thread
//! PUTs periodic reports.

use super::aggregate::AggregateRuntime;
use super::sources::SourceRuntime;
use super::TypedProgram;
use crate::error::Error;
use crate::ringbuf::RingBuf;
use crate::wire::{decode_tuple, encode_tuple};
use crate::Tuple;
use sluice_types::{ENV_DEBUG, ENV_INPUT_RINGBUF, ENV_OUTPUT_RINGBUFS_REF, ENV_REPORT_URL};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const REPORT_PERIOD: Duration = Duration::from_secs(10);
/// How many idle polls between checks of the out-ref file's mtime.
const RELOAD_EVERY: u32 = 256;

pub struct WorkerConfig {
    pub program_path: PathBuf,
    pub input_ringbuf: Option<PathBuf>,
    pub output_ringbufs_ref: PathBuf,
    pub report_url: Option<String>,
    pub debug: bool,
}

impl WorkerConfig {
    /// Read the §6 contract from the environment.
    pub fn from_env(program_path: PathBuf) -> Result<WorkerConfig, Error> {
        let input = std::env::var(ENV_INPUT_RINGBUF).unwrap_or_default();
        let out_ref = std::env::var(ENV_OUTPUT_RINGBUFS_REF)
            .map_err(|_| Error::fatal(format!("{ENV_OUTPUT_RINGBUFS_REF} is not set")))?;
        let report_url = std::env::var(ENV_REPORT_URL).ok().filter(|s| !s.is_empty());
        let debug = std::env::var(ENV_DEBUG)
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);
        Ok(WorkerConfig {
            program_path,
            input_ringbuf: if input.is_empty() {
                None
            } else {
                Some(PathBuf::from(input))
            },
            output_ringbufs_ref: PathBuf::from(out_ref),
            report_url,
            debug,
        })
    }
}

#[derive(Default)]
struct Stats {
    tuples_in: AtomicU64,
    tuples_out: AtomicU64,
    groups: AtomicU64,
}

/// The set of output ring buffers, kept in sync with the out-ref file.
struct Outputs {
    ref_path: PathBuf,
    targets: Vec<RingBuf>,
    mtime: Option<SystemTime>,
}

impl Outputs {
    fn open(ref_path: &Path) -> Result<Outputs, Error> {
        let mut o = Outputs {
            ref_path: ref_path.to_path_buf(),
            targets: Vec::new(),
            mtime: None,
        };
        o.reload(true)?;
        Ok(o)
    }

    /// Re-read the reference file when its mtime moved.
    fn reload(&mut self, force: bool) -> Result<(), Error> {
        let mtime = std::fs::metadata(&self.ref_path)
            .and_then(|m| m.modified())
            .ok();
        if !force && mtime == self.mtime {
            return Ok(());
        }
        self.mtime = mtime;
        let listing = std::fs::read_to_string(&self.ref_path)
            .map_err(|e| Error::io(format!("reading {}", self.ref_path.display()), e))?;
        let mut targets = Vec::new();
        for line in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match RingBuf::load(Path::new(line)) {
                Ok(rb) => targets.push(rb),
                Err(e) => log::warn!("skipping output ring buffer {line}: {e}"),
            }
        }
        log::debug!("fan-out is now {} ring buffer(s)", targets.len());
        self.targets = targets;
        Ok(())
    }

    /// Write one tuple to every target, blocking under backpressure.
    fn emit(&self, words: &[u32]) {
        for rb in &self.targets {
            loop {
                match rb.enqueue(words) {
                    Ok(()) => break,
                    Err(Error::NoSpace) => std::thread::sleep(Duration::from_millis(1)),
                    Err(e) => {
                        log::error!("dropping tuple for {}: {e}", rb.path().display());
                        break;
                    }
                }
            }
        }
    }
}

/// Run the worker to completion (i.e. until the supervisor kills it).
pub fn run(config: WorkerConfig) -> Result<(), Error> {
    let program = TypedProgram::load(&config.program_path)?;
    log::info!(
        "worker for {} up (signature {})",
        program.node,
        &program.signature[..8.min(program.signature.len())]
    );
    let stats = Arc::new(Stats::default());
    if let Some(url) = &config.report_url {
        spawn_reporter(url.clone(), stats.clone());
    }
    let mut outputs = Outputs::open(&config.output_ringbufs_ref)?;

    if program.operation.is_source() {
        run_source(&program, &mut outputs, &stats)
    } else {
        let input_path = config
            .input_ringbuf
            .as_ref()
            .ok_or_else(|| Error::fatal("aggregate worker without an input ring buffer"))?;
        let input = RingBuf::load(input_path)?;
        run_aggregate(&program, input, &mut outputs, &stats)
    }
}

fn run_source(
    program: &TypedProgram,
    outputs: &mut Outputs,
    stats: &Stats,
) -> Result<(), Error> {
    let mut source = SourceRuntime::new(&program.operation)?;
    let mut idle: u32 = 0;
    loop {
        let (batch, pause) = source.next_batch()?;
        for tuple in batch {
            let words = encode_tuple(&program.out_schema, &tuple)?;
            outputs.emit(&words);
            stats.tuples_out.fetch_add(1, Ordering::Relaxed);
        }
        idle += 1;
        if idle % RELOAD_EVERY == 0 {
            outputs.reload(false)?;
        }
        match pause {
            Some(d) if !d.is_zero() => std::thread::sleep(d),
            Some(_) => {}
            // Exhausted (e.g. the CSV is fully read): stay up, the
            // supervisor owns our lifetime.
            None => std::thread::sleep(Duration::from_secs(1)),
        }
    }
}

fn run_aggregate(
    program: &TypedProgram,
    input: RingBuf,
    outputs: &mut Outputs,
    stats: &Stats,
) -> Result<(), Error> {
    let mut runtime = AggregateRuntime::new(
        &program.operation,
        &program.in_schema,
        &program.out_schema,
        HashMap::new(),
    )?;
    let mut backoff = Duration::from_micros(100);
    let mut polls: u32 = 0;
    loop {
        polls += 1;
        if polls % RELOAD_EVERY == 0 {
            outputs.reload(false)?;
        }
        let words = match input.dequeue()? {
            None => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(10));
                continue;
            }
            Some(words) => words,
        };
        backoff = Duration::from_micros(100);
        let tuple: Tuple = decode_tuple(&program.in_schema, &words)?;
        stats.tuples_in.fetch_add(1, Ordering::Relaxed);
        match runtime.process(tuple) {
            Ok(outs) => {
                for out in outs {
                    let words = encode_tuple(&program.out_schema, &out)?;
                    outputs.emit(&words);
                    stats.tuples_out.fetch_add(1, Ordering::Relaxed);
                }
                stats
                    .groups
                    .store(runtime.nb_groups() as u64, Ordering::Relaxed);
            }
            Err(e) => log::error!("dropping tuple: {e}"),
        }
    }
}

/// Periodically PUT counters to the supervisor; losses are harmless.
fn spawn_reporter(url: String, stats: Arc<Stats>) {
    std::thread::spawn(move || {
        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                log::warn!("no report client: {e}");
                return;
            }
        };
        loop {
            std::thread::sleep(REPORT_PERIOD);
            let body = serde_json::json!({
                "tuples_in": stats.tuples_in.load(Ordering::Relaxed),
                "tuples_out": stats.tuples_out.load(Ordering::Relaxed),
                "groups": stats.groups.load(Ordering::Relaxed),
            });
            if let Err(e) = client.put(&url).json(&body).send() {
                log::debug!("report to {url} failed: {e}");
            }
        }
    });
}
