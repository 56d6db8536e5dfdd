//! Drives a complete create or restore operation.
//!
//! [`OperationController`] runs the other components in order, moving through
//! [`OperationState`]s and reporting every step to an [`Observer`]:
//!
//! ```text
//! Idle -> Validating -> Building -> Executing -> (Verifying) -> (Checksumming) -> Done | Failed
//! ```
//!
//! Nothing is retried. A failure leaves the controller in
//! [`OperationState::Failed`] and is returned with the stage and command that
//! caused it.
use std::fmt;
use std::path::{Path, PathBuf};

use crate::artifact::ImageArtifact;
use crate::error::{Error, Result};
use crate::executor::{self, ConfirmationToken, ExecutionOptions, ExecutionResult};
use crate::naming;
use crate::pipeline::{self, Operation, PipelineRequest, PipelineSpec, TransformSelection};
use crate::platform;
use crate::rawio;
use crate::stage::Passphrase;
use crate::verify::{self, ChecksumReport, VerificationResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Validating,
    Building,
    Executing,
    Verifying,
    Checksumming,
    Done,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Done | OperationState::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Idle => "idle",
            OperationState::Validating => "validating",
            OperationState::Building => "building pipeline",
            OperationState::Executing => "executing",
            OperationState::Verifying => "verifying",
            OperationState::Checksumming => "computing checksums",
            OperationState::Done => "done",
            OperationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A byte-moving phase of an operation that reports progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Transfer,
    Verify,
    Checksum,
}

/// Receives progress from an [`OperationController`].
///
/// Progress callbacks are invoked from the pipeline's reader thread, hence the
/// `Sync` bound and `&self` receivers. Every method has a no-op default.
pub trait Observer: Sync {
    fn on_state(&self, _state: OperationState) {}

    /// A phase started; `total` is the number of bytes it will consume, when known.
    fn on_phase_start(&self, _phase: Phase, _total: Option<u64>) {}

    fn on_progress(&self, _phase: Phase, _bytes: u64) {}

    fn on_phase_end(&self, _phase: Phase) {}

    /// Asked to accept an advisory condition such as
    /// [`Error::InsufficientSpace`]. Returning `false` aborts the operation
    /// with that error.
    fn acknowledge(&self, _warning: &Error) -> bool {
        true
    }
}

/// An [`Observer`] that ignores everything and accepts every warning.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentObserver;

impl Observer for SilentObserver {}

/// Hook for checks a caller wants enforced before devices are touched, such
/// as external locking.
pub trait Preconditions: Sync {
    /// Called before a create reads `source`. Defaults to a warning when the
    /// source is mounted, since a live filesystem may be imaged inconsistently.
    fn check_source(&self, source: &Path) -> Result<()> {
        if let Some(mount_point) = platform::mount_point_of(source)? {
            log::warn!(
                "{} is mounted at {}; the image may be inconsistent",
                source.display(),
                mount_point.display()
            );
        }
        Ok(())
    }

    /// Called before a restore writes `destination`. Defaults to refusing a
    /// mounted destination.
    fn check_destination(&self, destination: &Path) -> Result<()> {
        match platform::mount_point_of(destination)? {
            Some(mount_point) => Err(Error::DeviceMounted {
                device: destination.to_path_buf(),
                mount_point,
            }),
            None => Ok(()),
        }
    }
}

/// The default [`Preconditions`]: mount checks only.
#[derive(Clone, Copy, Debug, Default)]
pub struct MountCheck;

impl Preconditions for MountCheck {}

#[derive(Clone, Debug)]
pub struct CreateRequest {
    /// Device or image file to read.
    pub source: PathBuf,
    /// Output path without suffixes, e.g. `/tmp/backup_sda1`. The `.himg`
    /// marker and stage extensions are appended.
    pub output: PathBuf,
    pub selections: Vec<TransformSelection>,
    pub passphrase: Option<Passphrase>,
    pub split_size: Option<String>,
    pub verify: bool,
    pub checksums: bool,
}

#[derive(Clone, Debug)]
pub struct CreateOutcome {
    pub spec: PipelineSpec,
    pub artifact: ImageArtifact,
    pub execution: ExecutionResult,
    pub verification: Option<VerificationResult>,
    pub checksums: Option<ChecksumReport>,
}

#[derive(Clone, Debug)]
pub struct RestoreRequest {
    /// The artifact, by logical name or by any of its parts.
    pub artifact: PathBuf,
    pub destination: PathBuf,
    /// Stages in the order they were applied at create time. When set they
    /// are used instead of the stages decoded from the artifact name, which
    /// allows restoring artifacts whose names do not follow the convention.
    pub declared_stages: Option<Vec<TransformSelection>>,
    pub passphrase: Option<Passphrase>,
    /// Validate checksum sidecars before anything is written.
    pub check_checksums: bool,
    pub confirmation: Option<ConfirmationToken>,
}

#[derive(Clone, Debug)]
pub struct RestoreOutcome {
    pub spec: PipelineSpec,
    pub artifact: ImageArtifact,
    pub execution: ExecutionResult,
}

pub struct OperationController {
    options: ExecutionOptions,
    observer: Box<dyn Observer>,
    preconditions: Box<dyn Preconditions>,
    state: OperationState,
}

impl OperationController {
    pub fn new(options: ExecutionOptions) -> Self {
        Self {
            options,
            observer: Box::new(SilentObserver),
            preconditions: Box::new(MountCheck),
            state: OperationState::Idle,
        }
    }

    pub fn with_observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn with_preconditions(mut self, preconditions: impl Preconditions + 'static) -> Self {
        self.preconditions = Box::new(preconditions);
        self
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    fn enter(&mut self, state: OperationState) {
        log::debug!("Operation state: {} -> {}", self.state, state);
        self.state = state;
        self.observer.on_state(state);
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.enter(OperationState::Done),
            Err(e) => {
                log::info!("Operation failed while {}: {e}", self.state);
                self.enter(OperationState::Failed);
            }
        }
        result
    }

    /// Creates an image artifact from `request.source`.
    ///
    /// Checksums are only computed once the artifact has been written and, if
    /// requested, verified, so a failed create never leaves sidecars behind.
    pub fn create(&mut self, request: &CreateRequest) -> Result<CreateOutcome> {
        self.state = OperationState::Idle;
        let result = self.run_create(request);
        self.settle(result)
    }

    fn run_create(&mut self, request: &CreateRequest) -> Result<CreateOutcome> {
        self.enter(OperationState::Validating);
        rawio::check_block_size(self.options.block_size)?;
        let handle = rawio::probe(&request.source)?;
        self.preconditions.check_source(&request.source)?;

        self.enter(OperationState::Building);
        let mut spec = pipeline::build(&PipelineRequest {
            operation: Operation::Create,
            source: request.source.clone(),
            sink: request.output.clone(),
            selections: request.selections.clone(),
            passphrase: request.passphrase.clone(),
            split_size: request.split_size.clone(),
            verify: request.verify,
            checksums: request.checksums,
        })?;
        spec.sink = naming::encode_path(&request.output, &spec.applied_stages());
        if spec.sink == spec.source {
            return Err(Error::invalid("the artifact name would overwrite the source"));
        }
        log::info!(
            "Creating {} from {} ({} bytes)",
            spec.sink.display(),
            spec.source.display(),
            handle.len
        );
        self.check_space(&spec.sink, handle.len)?;

        self.enter(OperationState::Executing);
        let observer = self.observer.as_ref();
        let execution = executor::execute(
            &spec,
            None,
            &self.options,
            |total| observer.on_phase_start(Phase::Transfer, total),
            |bytes| observer.on_progress(Phase::Transfer, bytes),
        )?;
        observer.on_phase_end(Phase::Transfer);
        let artifact = ImageArtifact::from_outputs(
            &spec.sink,
            execution.outputs.clone(),
            spec.split_chunk_size.is_some(),
        );

        let verification = if spec.verify {
            self.enter(OperationState::Verifying);
            let observer = self.observer.as_ref();
            let result = verify::verify(
                &spec,
                &artifact,
                &self.options,
                |total| observer.on_phase_start(Phase::Verify, Some(total)),
                |bytes| observer.on_progress(Phase::Verify, bytes),
            )?;
            observer.on_phase_end(Phase::Verify);
            Some(result)
        } else {
            None
        };

        let checksums = if spec.generate_checksums {
            self.enter(OperationState::Checksumming);
            let observer = self.observer.as_ref();
            let report = verify::checksum(
                &artifact,
                &self.options.running,
                |total| observer.on_phase_start(Phase::Checksum, Some(total)),
                |bytes| observer.on_progress(Phase::Checksum, bytes),
            )?;
            observer.on_phase_end(Phase::Checksum);
            Some(report)
        } else {
            None
        };

        Ok(CreateOutcome {
            spec,
            artifact,
            execution,
            verification,
            checksums,
        })
    }

    /// Warns through the observer when the output filesystem has less free
    /// space than the uncompressed source.
    fn check_space(&self, sink: &Path, required: u64) -> Result<()> {
        let dir = match sink.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let available = rawio::free_space(dir)?;
        if available >= required {
            return Ok(());
        }
        let warning = Error::InsufficientSpace {
            path: dir.to_path_buf(),
            required,
            available,
        };
        log::warn!("{warning}");
        if self.observer.acknowledge(&warning) {
            Ok(())
        } else {
            Err(warning)
        }
    }

    /// Restores an artifact onto `request.destination`.
    ///
    /// Once the destination has been opened for writing, any failure is
    /// returned as [`Error::PartialRestore`].
    pub fn restore(&mut self, request: &RestoreRequest) -> Result<RestoreOutcome> {
        self.state = OperationState::Idle;
        let result = self.run_restore(request);
        self.settle(result)
    }

    fn run_restore(&mut self, request: &RestoreRequest) -> Result<RestoreOutcome> {
        self.enter(OperationState::Validating);
        rawio::check_block_size(self.options.block_size)?;
        let artifact = ImageArtifact::discover(&request.artifact)?;
        if artifact.is_empty()? {
            return Err(Error::invalid(format!("{} is empty", artifact.path.display())));
        }

        let selections = match (&request.declared_stages, artifact.decode_name()) {
            (Some(declared), decoded) => {
                if let Ok(decoded) = decoded {
                    let decoded: Vec<TransformSelection> = decoded.stages.into_iter().map(Into::into).collect();
                    if &decoded != declared {
                        log::warn!("Using declared stages instead of those in the artifact name");
                    }
                }
                declared.clone()
            }
            (None, Ok(decoded)) => decoded.stages.into_iter().map(Into::into).collect(),
            (None, Err(e)) => return Err(e),
        };

        if request.check_checksums {
            if let Some((path, algorithm)) = verify::find_checksum_mismatch(&artifact)? {
                return Err(Error::ChecksumMismatch { path, algorithm });
            }
            log::info!("Checksums of {} match their sidecars", artifact.path.display());
        }

        self.preconditions.check_destination(&request.destination)?;
        let token = match &request.confirmation {
            Some(token) if token.covers(&request.destination) => token,
            _ => return Err(Error::DestructiveActionNotConfirmed(request.destination.clone())),
        };

        self.enter(OperationState::Building);
        let spec = pipeline::build(&PipelineRequest {
            operation: Operation::Restore,
            source: artifact.path.clone(),
            sink: request.destination.clone(),
            selections,
            passphrase: request.passphrase.clone(),
            split_size: None,
            verify: false,
            checksums: false,
        })?;
        log::info!("Restoring {} to {}", artifact.path.display(), spec.sink.display());

        self.enter(OperationState::Executing);
        let observer = self.observer.as_ref();
        let mut writing = false;
        let result = executor::execute(
            &spec,
            Some(token),
            &self.options,
            |total| {
                writing = true;
                observer.on_phase_start(Phase::Transfer, total);
            },
            |bytes| observer.on_progress(Phase::Transfer, bytes),
        );
        let execution = match result {
            Ok(execution) => execution,
            Err(e) if writing => {
                return Err(Error::PartialRestore {
                    destination: spec.sink.clone(),
                    source: Box::new(e),
                });
            }
            Err(e) => return Err(e),
        };
        observer.on_phase_end(Phase::Transfer);

        Ok(RestoreOutcome {
            spec,
            artifact,
            execution,
        })
    }
}
