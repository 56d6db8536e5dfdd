use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Process exit code for a run that failed before or while executing.
pub const EXIT_FAILURE: i32 = 1;
/// Process exit code for a run that completed but produced wrong bytes.
pub const EXIT_VERIFICATION_MISMATCH: i32 = 2;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Device not found: {}", .0.display())]
    DeviceNotFound(PathBuf),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Unrecognized image format: '{0}' does not follow the <name>.himg[.enc][.comp] convention")]
    UnrecognizedFormat(String),

    #[error("Pipeline failed at stage '{stage}' ({command}): {reason}")]
    PipelineFailed {
        stage: String,
        command: String,
        reason: String,
    },

    #[error("Verification failed: restored stream differs from the source at byte offset {0}")]
    VerificationMismatch(u64),

    #[error("Verification could not complete: {0}")]
    VerificationError(String),

    #[error("Checksum mismatch: {algorithm} sidecar disagrees with {}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        algorithm: &'static str,
    },

    #[error(
        "Insufficient space on {}: {required} bytes may be needed, {available} available",
        .path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("Destructive write to {} was not confirmed", .0.display())]
    DestructiveActionNotConfirmed(PathBuf),

    #[error("{} is mounted at {}; unmount it first", .device.display(), .mount_point.display())]
    DeviceMounted {
        device: PathBuf,
        mount_point: PathBuf,
    },

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error(
        "Restore to {} failed: {source}. The destination may now be in a partially-overwritten, inconsistent state",
        .destination.display()
    )]
    PartialRestore {
        destination: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps the error to the exit code a front-end should terminate with.
    ///
    /// Only a verification mismatch gets its own code, so that automation can
    /// tell "ran but produced wrong bytes" apart from "failed to run".
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::VerificationMismatch(_) => EXIT_VERIFICATION_MISMATCH,
            Error::PartialRestore { source, .. } => source.exit_code(),
            _ => EXIT_FAILURE,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidSelection(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
