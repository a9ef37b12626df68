//! Unified error types for the jail builder

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for all jail operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to create C string: {0}")]
    CString(#[from] std::ffi::NulError),

    // Config errors (§4.J)
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration error: unknown property '{0}'")]
    UnknownProperty(String),

    #[error("configuration error: invalid regex '{pattern}': {message}")]
    BadRegex { pattern: String, message: String },

    #[error("configuration error: invalid name '{0}'")]
    InvalidName(String),

    // Policy errors (§4.B)
    #[error("policy: {0} outside writepath")]
    Policy(PathBuf),

    // Filesystem / clone errors (§4.C)
    #[error("source not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("type mismatch cloning onto {path}: destination is a different file type")]
    TypeMismatch { path: PathBuf },

    #[error("filesystem error on {path}: {source}")]
    Filesystem { path: PathBuf, source: io::Error },

    #[error("{path} exists with mismatched device number")]
    DeviceMismatch { path: PathBuf },

    #[error("{link} already exists and does not point to {target}")]
    SymlinkMismatch { link: PathBuf, target: PathBuf },

    // Dependency resolution errors (§4.D)
    #[error("dynamic loader not found (searched with: {0})")]
    LoaderNotFound(String),

    #[error("dependency command failed: {0}")]
    DependencyCommand(String),

    #[error("dependency listing for {0} matched no paths")]
    NoDependenciesFound(PathBuf),

    // Mount errors (§4.F)
    #[error("mount failed for {path}: {message}")]
    Mount { path: PathBuf, message: String },

    #[error("unmount failed for {path}: {message}")]
    Unmount { path: PathBuf, message: String },

    // Execute errors (§4.I)
    #[error("chroot to {path} failed: {message}")]
    Chroot { path: PathBuf, message: String },

    #[error("privilege drop failed: {0}")]
    PrivilegeDrop(String),

    #[error("exec of {program} failed: {message}")]
    Exec { program: String, message: String },

    // Sequencer errors (§4.H)
    #[error("step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<Error>,
    },
}

/// Result type alias used throughout the jail builder
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that represent a write-policy violation (§4.B).
    /// Looks through a `Step` wrapper so callers can classify the error a
    /// failed run actually returned, not just a bare one raised in isolation.
    pub fn is_policy(&self) -> bool {
        match self {
            Error::Policy(_) => true,
            Error::Step { source, .. } => source.is_policy(),
            _ => false,
        }
    }

    /// True for configuration-time errors (unknown property, bad regex, bad config file).
    ///
    /// `--try` suppresses these the same way it suppresses execution failures
    /// (§9, open question b): a missing property is functionally indistinguishable
    /// from a missing file at the step's granularity.
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::Config(_)
            | Error::UnknownProperty(_)
            | Error::BadRegex { .. }
            | Error::InvalidName(_)
            | Error::ConfigRead { .. }
            | Error::ConfigParse(_) => true,
            Error::Step { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}
