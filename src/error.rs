//! The engine error type.

use serde::Serialize;
use sluice_types::error::DetailedError;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt::{Display, Error as FmtError, Formatter};

/// Everything that can go wrong between a submitted operation and a
/// running worker.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Error {
    /// Parse or type-inference failure, locating the node.
    Syntax { node: String, message: String },
    /// A status transition that is not allowed.
    InvalidCommand { message: String },
    /// A parent outside the layer being compiled is not compiled yet.
    MissingDependency { node: String, parent: String },
    /// The compile loop exceeded its retry bound.
    DependencyLoop { layers: Vec<String> },
    /// Ring buffer full: backpressure, retry later.
    NoSpace,
    /// The message can never fit the ring buffer.
    MessageTooBig { nb_words: u32, capacity: u32 },
    NotRunning { layer: String },
    AlreadyRunning { layer: String },
    NotFound { what: String },
    /// Ring-buffer corruption, aborted children, unusable files.
    Fatal { message: String },
    Io { context: String, error: String },
}

impl Error {
    pub fn syntax(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Syntax {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, error: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            error: error.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Syntax { node, message } => {
                write!(f, "In node '{node}': {message}")
            }
            Self::InvalidCommand { message } => write!(f, "Invalid command: {message}"),
            Self::MissingDependency { node, parent } => {
                write!(f, "Node '{node}' depends on '{parent}' which is not compiled")
            }
            Self::DependencyLoop { layers } => {
                write!(f, "Dependency loop involving layers {layers:?}")
            }
            Self::NoSpace => f.write_str("Ring buffer full"),
            Self::MessageTooBig { nb_words, capacity } => {
                write!(
                    f,
                    "Message of {nb_words} words can never fit a ring buffer of {capacity} words"
                )
            }
            Self::NotRunning { layer } => write!(f, "Layer '{layer}' is not running"),
            Self::AlreadyRunning { layer } => write!(f, "Layer '{layer}' is already running"),
            Self::NotFound { what } => write!(f, "Unknown {what}"),
            Self::Fatal { message } => write!(f, "Fatal: {message}"),
            Self::Io { context, error } => write!(f, "I/O error {context}: {error}"),
        }
    }
}

impl DetailedError for Error {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Syntax { .. } => Cow::from("SyntaxError"),
            Self::InvalidCommand { .. } => Cow::from("InvalidCommand"),
            Self::MissingDependency { .. } => Cow::from("MissingDependency"),
            Self::DependencyLoop { .. } => Cow::from("DependencyLoop"),
            Self::NoSpace => Cow::from("NoSpace"),
            Self::MessageTooBig { .. } => Cow::from("MessageTooBig"),
            Self::NotRunning { .. } => Cow::from("NotRunning"),
            Self::AlreadyRunning { .. } => Cow::from("AlreadyRunning"),
            Self::NotFound { .. } => Cow::from("NotFound"),
            Self::Fatal { .. } => Cow::from("Fatal"),
            Self::Io { .. } => Cow::from("IoError"),
        }
    }

    fn log_level(&self) -> log::Level {
        match self {
            Self::NoSpace | Self::NotRunning { .. } | Self::AlreadyRunning { .. } => {
                log::Level::Debug
            }
            Self::Fatal { .. } | Self::Io { .. } => log::Level::Error,
            _ => log::Level::Warn,
        }
    }
}
