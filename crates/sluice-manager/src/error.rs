//! The manager's top-level error type, returned by every HTTP endpoint.
//!
//! Engine errors (`sluice::Error`) are wrapped and mapped onto HTTP
//! statuses; the response body is always an
//! [`ErrorResponse`](sluice_types::error::ErrorResponse).

use actix_web::{
    body::BoxBody, http::StatusCode, HttpResponse, HttpResponseBuilder, ResponseError,
};
use log::Level;
use serde::Serialize;
use sluice::Error as EngineError;
use sluice_types::error::{DetailedError, ErrorResponse};
use std::{
    borrow::Cow,
    error::Error as StdError,
    fmt::{Display, Error as FmtError, Formatter},
    io::Error as IOError,
};

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ManagerError {
    EngineError {
        #[serde(flatten)]
        error: EngineError,
    },
    UnknownLayer {
        name: String,
    },
    UnknownNode {
        name: String,
    },
    UnknownAccept {
        accept: String,
    },
    NotExported {
        name: String,
    },
    InvalidLayerSpec {
        error: String,
    },
    #[serde(serialize_with = "serialize_io_error")]
    IoError {
        context: String,
        io_error: IOError,
    },
}

impl ManagerError {
    pub fn io_error(context: String, io_error: IOError) -> Self {
        Self::IoError { context, io_error }
    }
}

fn serialize_io_error<S>(
    context: &String,
    io_error: &IOError,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeStruct;
    let mut ser = serializer.serialize_struct("IoError", 3)?;
    ser.serialize_field("context", &context)?;
    ser.serialize_field("kind", &io_error.kind().to_string())?;
    ser.serialize_field("os_error", &io_error.raw_os_error())?;
    ser.end()
}

impl StdError for ManagerError {}

impl From<EngineError> for ManagerError {
    fn from(error: EngineError) -> Self {
        Self::EngineError { error }
    }
}

impl Display for ManagerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::EngineError { error } => error.fmt(f),
            Self::UnknownLayer { name } => write!(f, "Unknown layer '{name}'"),
            Self::UnknownNode { name } => write!(f, "Unknown node '{name}'"),
            Self::UnknownAccept { accept } => {
                write!(f, "Cannot render the graph as '{accept}'")
            }
            Self::NotExported { name } => {
                write!(f, "Node '{name}' does not EXPORT its tuples")
            }
            Self::InvalidLayerSpec { error } => write!(f, "Invalid layer: {error}"),
            Self::IoError { context, io_error } => {
                write!(f, "I/O error {context}: {io_error}")
            }
        }
    }
}

impl ResponseError for ManagerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::EngineError { error } => match error {
                EngineError::Syntax { .. }
                | EngineError::InvalidCommand { .. }
                | EngineError::MissingDependency { .. }
                | EngineError::DependencyLoop { .. }
                | EngineError::NotRunning { .. }
                | EngineError::AlreadyRunning { .. }
                | EngineError::MessageTooBig { .. } => StatusCode::BAD_REQUEST,
                EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
                EngineError::NoSpace => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Fatal { .. } | EngineError::Io { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::UnknownLayer { .. } | Self::UnknownNode { .. } => StatusCode::NOT_FOUND,
            Self::UnknownAccept { .. }
            | Self::NotExported { .. }
            | Self::InvalidLayerSpec { .. } => StatusCode::BAD_REQUEST,
            Self::IoError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse<BoxBody> {
        HttpResponseBuilder::new(self.status_code()).json(ErrorResponse::from_error(self))
    }
}

impl DetailedError for ManagerError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::EngineError { error } => error.error_code(),
            Self::UnknownLayer { .. } => Cow::from("UnknownLayer"),
            Self::UnknownNode { .. } => Cow::from("UnknownNode"),
            Self::UnknownAccept { .. } => Cow::from("UnknownAccept"),
            Self::NotExported { .. } => Cow::from("NotExported"),
            Self::InvalidLayerSpec { .. } => Cow::from("InvalidLayerSpec"),
            Self::IoError { .. } => Cow::from("ManagerIoError"),
        }
    }

    fn log_level(&self) -> Level {
        match self {
            Self::EngineError { error } => error.log_level(),
            Self::UnknownLayer { .. } | Self::UnknownNode { .. } => Level::Debug,
            _ => Level::Error,
        }
    }
}
