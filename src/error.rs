use std::path::PathBuf;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PrepError {
    #[error("invalid participant label: {0}")]
    InvalidSubjectLabel(String),

    #[error("invalid session label: {0}")]
    InvalidSessionLabel(String),

    #[error("invalid phase encoding direction: {0:?}")]
    InvalidPhaseEncoding(String),

    #[error("malformed b-value table {path}: token {token:?} is not numeric")]
    MalformedBvals { path: String, token: String },

    #[error("malformed b-vector table {path}: {message}")]
    BvecShape { path: String, message: String },

    #[error("required file does not exist: {0}")]
    MissingFile(Utf8PathBuf),

    #[error("{path} is missing required metadata field {field}")]
    MissingMetadata { path: String, field: &'static str },

    #[error("input directory does not exist: {0}")]
    InputNotFound(Utf8PathBuf),

    #[error("no diffusion-weighted acquisition found for this session")]
    NoDwi,

    #[error("diffusion acquisition has no volume below the b0 threshold: {0}")]
    NoLowBVolume(String),

    #[error("cannot merge {first} and {other}: b-value tables differ")]
    DwiMergeMismatch { first: String, other: String },

    #[error("failed to read NIfTI header {path}: {message}")]
    Nifti { path: String, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal invariant violated: {0}")]
    #[diagnostic(help("this is a bug in the topup decision logic, please report it"))]
    InternalInvariant(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("malformed acquisition parameter table: {0}")]
    AcqpParse(String),

    #[error("unexpected eddy output {path}: {message}")]
    EddyOutput { path: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
