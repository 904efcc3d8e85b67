use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::workflow::Parameter;

/// Failure while pulling one artifact from its remote source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to run fetch command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("fetch command '{command}' exited with {status}")]
    CommandFailed { command: String, status: String },
    #[error("fetch command '{command}' exited successfully but {} is missing", .path.display())]
    NotProduced { command: String, path: PathBuf },
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A required weight could not be provisioned. Fatal at startup.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to fetch weight '{name}': {source}")]
    Fetch {
        name: String,
        #[source]
        source: FetchError,
    },
    #[error("SHA256 mismatch for weight '{name}': expected {expected}, got {actual}")]
    Checksum {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("failed to prepare {} for weight '{name}': {source}", .path.display())]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read workflow template {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse workflow template {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("workflow template has no node '{node}' (bound to parameter '{parameter}')")]
    MissingNode { parameter: Parameter, node: String },
    #[error("workflow node '{node}' has no input '{field}' (bound to parameter '{parameter}')")]
    MissingField {
        parameter: Parameter,
        node: String,
        field: String,
    },
    #[error("unknown binding parameter '{0}'")]
    UnknownParameter(String),
    #[error("binding for parameter '{0}' lists no locations")]
    EmptyBinding(Parameter),
}

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: String,
        max: String,
    },
    #[error("seed must be -1 (random) or a non-negative integer, got {0}")]
    InvalidSeed(i64),
    #[error("{field} does not point to a readable file: {}", .path.display())]
    MissingFile { field: &'static str, path: PathBuf },
}

/// Failure reported by, or while talking to, the external execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("execution engine unreachable: {0}")]
    Unreachable(String),
    #[error("execution engine rejected the workflow (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("execution engine failed: {message}")]
    Failed { message: String },
    #[error("execution did not finish within {:?}", .elapsed)]
    TimedOut { elapsed: Duration },
    #[error("unexpected response from execution engine: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
#[error("failed to stage {kind} {} into {}: {source}", .source_path.display(), .input_dir.display())]
pub struct StagingError {
    pub kind: &'static str,
    pub source_path: PathBuf,
    pub input_dir: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Terminal failure of one prediction request.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("invalid prediction input: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("error executing workflow: {0}")]
    Execution(#[from] EngineError),
    #[error("no output video generated in {}", .dir.display())]
    NoOutput { dir: PathBuf },
}

impl PredictError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}
