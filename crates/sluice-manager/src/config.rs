//! Manager configuration, read from command line arguments (or a JSON
//! config file deserialized into the same struct).

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    29380
}

fn default_data_directory() -> String {
    "/var/lib/sluice".to_string()
}

const fn default_ringbuf_words() -> u32 {
    1 << 16
}

const fn default_export_retention() -> usize {
    sluice::export::DEFAULT_RETENTION
}

const fn default_sweep_seconds() -> u64 {
    2
}

/// Sluice manager: compiles and supervises operator graphs.
#[derive(Parser, Deserialize, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ManagerConfig {
    /// Address the HTTP control surface binds to.
    #[serde(default = "default_bind_address")]
    #[arg(short, long, default_value_t = default_bind_address())]
    pub bind_address: String,

    /// Port of the HTTP control surface.
    #[serde(default = "default_port")]
    #[arg(short, long, default_value_t = default_port())]
    pub port: u16,

    /// Directory for the graph file, program artifacts and ring buffers.
    #[serde(default = "default_data_directory")]
    #[arg(short, long, default_value_t = default_data_directory())]
    pub data_directory: String,

    /// Worker executable; defaults to `sluice-worker` next to this
    /// binary.
    #[serde(default)]
    #[arg(short, long)]
    pub worker_path: Option<String>,

    /// Ring buffer capacity in 32-bit words.
    #[serde(default = "default_ringbuf_words")]
    #[arg(long, default_value_t = default_ringbuf_words())]
    pub ringbuf_words: u32,

    /// How many tuples to retain per exported node.
    #[serde(default = "default_export_retention")]
    #[arg(long, default_value_t = default_export_retention())]
    pub export_retention: usize,

    /// Seconds between child-reaping / layer-timeout sweeps.
    #[serde(default = "default_sweep_seconds")]
    #[arg(long, default_value_t = default_sweep_seconds())]
    pub sweep_seconds: u64,

    /// Pass debug=1 to workers and log verbosely.
    #[serde(default)]
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

impl ManagerConfig {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_directory)
    }

    pub fn graph_path(&self) -> PathBuf {
        self.data_dir().join("graph.json")
    }

    /// Typed-program artifacts, one per signature.
    pub fn bin_dir(&self) -> PathBuf {
        self.data_dir().join("bin")
    }

    pub fn program_path(&self, signature: &str) -> PathBuf {
        self.bin_dir().join(format!("{signature}.json"))
    }

    /// Per-node working directory (ring buffers, out-ref file).
    pub fn node_dir(&self, layer: &str, node: &str) -> PathBuf {
        self.data_dir().join("workers").join(layer).join(node)
    }

    pub fn input_ringbuf_path(&self, layer: &str, node: &str, signature: &str) -> PathBuf {
        self.node_dir(layer, node)
            .join(format!("in.{}.rb", &signature[..8.min(signature.len())]))
    }

    pub fn export_ringbuf_path(&self, layer: &str, node: &str, signature: &str) -> PathBuf {
        self.node_dir(layer, node)
            .join(format!("export.{}.rb", &signature[..8.min(signature.len())]))
    }

    pub fn out_ref_path(&self, layer: &str, node: &str) -> PathBuf {
        self.node_dir(layer, node).join("out_ringbufs_ref")
    }

    pub fn worker_exe(&self) -> PathBuf {
        match &self.worker_path {
            Some(p) => PathBuf::from(p),
            None => std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf))
                .unwrap_or_default()
                .join("sluice-worker"),
        }
    }

    pub fn report_url(&self, layer: &str, node: &str) -> String {
        format!(
            "http://{}:{}/report/{layer}/{node}",
            self.bind_address, self.port
        )
    }
}
