//! Runs a [`PipelineSpec`] as one connected byte-stream pipeline.
//!
//! The source reader, every stage and the sink each run as an independent
//! unit of work: the reader and the stages on their own scoped threads, the
//! sink on the calling thread. They are connected by bounded pipes, so a slow
//! sink throttles the reader and nothing buffers the whole image.
//!
//! The pipeline fails fast. A stage that errors drops both of its pipe ends,
//! which breaks the stages next to it, and the whole run is reported as
//! [`Error::PipelineFailed`] naming the stage that failed first. Create output
//! is only renamed to its final name after every unit succeeded.
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::artifact::ImageArtifact;
use crate::error::{Error, Result};
use crate::pipe::{PipeReader, PipeWriter, pipe};
use crate::pipeline::{Operation, PipelineSpec};
use crate::rawio::{self, DEFAULT_BLOCK_SIZE, RawReader};
use crate::split::OutputWriter;
use crate::stage::{Backend, PASSPHRASE_ENV, Passphrase, PlannedStage};
use crate::transform;

const COPY_CHUNK: usize = 256 * 1024;
const SINK_BUFFER: usize = 4 * 1024 * 1024;

/// How a pipeline is run, independent of what it does.
#[derive(Clone, Debug)]
pub struct ExecutionOptions {
    pub backend: Backend,
    /// Raw device read size; a multiple of 512.
    pub block_size: usize,
    /// Cleared to cancel the operation.
    pub running: Arc<AtomicBool>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Native,
            block_size: DEFAULT_BLOCK_SIZE,
            running: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl ExecutionOptions {
    fn cancelled(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

/// Explicit consent to overwrite one restore destination.
///
/// A restore refuses to open its destination unless it is handed a token
/// confirmed for that exact path.
#[derive(Clone, Debug)]
pub struct ConfirmationToken {
    destination: PathBuf,
}

impl ConfirmationToken {
    pub fn confirm(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn covers(&self, path: &Path) -> bool {
        let canonical = |p: &Path| fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
        self.destination == path || canonical(&self.destination) == canonical(path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed(String),
}

/// What happened to one unit of the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageReport {
    pub label: String,
    pub command: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub outcome: StageOutcome,
}

impl StageReport {
    fn new(label: String, command: String, bytes_in: u64, bytes_out: u64, result: &io::Result<()>) -> Self {
        let outcome = match result {
            Ok(()) => StageOutcome::Succeeded,
            Err(e) => StageOutcome::Failed(e.to_string()),
        };
        Self {
            label,
            command,
            bytes_in,
            bytes_out,
            outcome,
        }
    }
}

/// The result of a successful [`execute`].
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    /// Files written: the artifact or its parts for create, the destination for restore.
    pub outputs: Vec<PathBuf>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Reports for the source reader, each stage and the sink, in pipeline order.
    pub stages: Vec<StageReport>,
}

/// Executes `spec`, reporting progress through callbacks.
///
/// # Arguments
///
/// * `spec` - The pipeline to run.
/// * `confirmation` - Required for restore: a token confirmed for `spec.sink`.
/// * `options` - Backend, block size and cancellation flag.
/// * `on_start` - Called once with the number of source bytes, when known.
/// * `on_progress` - Called with the number of source bytes consumed so far.
///
/// A create replaces whatever an earlier create left at `spec.sink`: the
/// single-file artifact, its split parts and their checksum sidecars.
///
/// # Errors
///
/// - [`Error::DestructiveActionNotConfirmed`] before anything is opened when a
///   restore has no matching token.
/// - [`Error::DeviceNotFound`] / [`Error::FileNotFound`] for a missing source.
/// - [`Error::PipelineFailed`] when any unit fails; create output is then left
///   under `.incomplete` names.
/// - [`Error::Cancelled`] when `options.running` is cleared.
pub fn execute<F>(
    spec: &PipelineSpec,
    confirmation: Option<&ConfirmationToken>,
    options: &ExecutionOptions,
    on_start: impl FnOnce(Option<u64>),
    mut on_progress: F,
) -> Result<ExecutionResult>
where
    F: FnMut(u64) + Send,
{
    match spec.operation {
        Operation::Create => {
            let handle = rawio::probe(&spec.source)?;
            let mut reader = RawReader::open(&handle, options.block_size)?;
            // No earlier artifact, part or sidecar may survive under this name.
            ImageArtifact::remove_existing(&spec.sink)?;
            let mut writer = OutputWriter::new(&spec.sink, spec.split_chunk_size)?;
            on_start(Some(handle.len));

            let sink_label = format!("write {}", spec.sink.display());
            let run = run_stages(
                &mut reader,
                &spec.source,
                &spec.stages,
                spec.passphrase.as_ref(),
                &mut writer,
                &sink_label,
                options,
                &mut on_progress,
            );
            if let Err(e) = run.outcome(options) {
                let left = writer.abandon();
                log::warn!("Create failed, {} partial file(s) left behind: {e}", left.len());
                return Err(e);
            }
            let outputs = writer.commit()?;
            log::info!(
                "Created {} ({} file(s), {} bytes)",
                spec.sink.display(),
                outputs.len(),
                run.bytes_written
            );
            Ok(run.into_result(outputs))
        }
        Operation::Restore => {
            if !confirmation.is_some_and(|t| t.covers(&spec.sink)) {
                return Err(Error::DestructiveActionNotConfirmed(spec.sink.clone()));
            }

            let artifact = ImageArtifact::discover(&spec.source)?;
            let mut reader = artifact.open()?;
            let total = artifact.len()?;
            let mut destination = BufWriter::with_capacity(SINK_BUFFER, rawio::open_destination(&spec.sink)?);
            on_start(Some(total));

            let sink_label = format!("write {}", spec.sink.display());
            let run = run_stages(
                &mut reader,
                &artifact.path,
                &spec.stages,
                spec.passphrase.as_ref(),
                &mut destination,
                &sink_label,
                options,
                &mut on_progress,
            );
            run.outcome(options)?;
            destination.flush()?;
            destination.get_ref().sync_all()?;
            log::info!("Restored {} bytes to {}", run.bytes_written, spec.sink.display());
            Ok(run.into_result(vec![spec.sink.clone()]))
        }
    }
}

/// Byte-counting adapter.
struct Counted<T> {
    inner: T,
    count: u64,
}

impl<T> Counted<T> {
    fn new(inner: T) -> Self {
        Self { inner, count: 0 }
    }
}

impl<T: Read> Read for Counted<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

impl<T: Write> Write for Counted<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The reports of one pipeline run.
pub(crate) struct Run {
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
    pub(crate) reports: Vec<StageReport>,
    failures: Vec<(usize, io::Error)>,
}

impl Run {
    /// Collapses the run into its first meaningful failure.
    ///
    /// Broken pipes are symptoms of another unit failing, so a unit that
    /// failed for any other reason is preferred as the culprit.
    pub(crate) fn outcome(&self, options: &ExecutionOptions) -> Result<()> {
        if options.cancelled() {
            return Err(Error::Cancelled);
        }
        let culprit = self
            .failures
            .iter()
            .find(|(_, e)| e.kind() != io::ErrorKind::BrokenPipe)
            .or_else(|| self.failures.first());
        match culprit {
            None => Ok(()),
            Some((index, e)) => {
                let report = &self.reports[*index];
                Err(Error::PipelineFailed {
                    stage: report.label.clone(),
                    command: report.command.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn into_result(self, outputs: Vec<PathBuf>) -> ExecutionResult {
        ExecutionResult {
            outputs,
            bytes_read: self.bytes_read,
            bytes_written: self.bytes_written,
            stages: self.reports,
        }
    }
}

/// Connects `source` through `stages` into `sink` and runs everything to
/// completion or first failure.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_stages(
    source: &mut (dyn Read + Send),
    source_path: &Path,
    stages: &[PlannedStage],
    passphrase: Option<&Passphrase>,
    sink: &mut dyn Write,
    sink_label: &str,
    options: &ExecutionOptions,
    on_progress: &mut (dyn FnMut(u64) + Send),
) -> Run {
    let running = options.running.as_ref();
    let backend = options.backend;

    let (source_result, stage_results, sink_result) = thread::scope(|scope| {
        let (source_tx, mut upstream) = pipe();
        let reader = scope.spawn(move || pump_source(source, source_tx, running, on_progress));

        let mut workers = Vec::with_capacity(stages.len());
        for planned in stages {
            let (tx, rx) = pipe();
            let input = std::mem::replace(&mut upstream, rx);
            workers.push(scope.spawn(move || run_stage(planned, passphrase, backend, input, tx)));
        }

        let sink_result = drain_into(upstream, sink, running);

        let source_result = reader.join().unwrap_or_else(|_| (0, Err(io::Error::other("source reader panicked"))));
        let stage_results: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|_| (0, 0, Err(io::Error::other("stage panicked")))))
            .collect();
        (source_result, stage_results, sink_result)
    });

    let mut reports = Vec::with_capacity(stages.len() + 2);
    let mut failures = Vec::new();

    let (bytes_read, result) = source_result;
    reports.push(StageReport::new(
        "read source".to_string(),
        format!("read {}", source_path.display()),
        bytes_read,
        bytes_read,
        &result,
    ));
    if let Err(e) = result {
        failures.push((0, e));
    }

    for (planned, (bytes_in, bytes_out, result)) in stages.iter().zip(stage_results) {
        let command = match backend {
            Backend::Native => format!("built-in {} codec", planned.stage.algorithm()),
            Backend::External => planned.stage.command(planned.direction).to_string(),
        };
        log::debug!("Stage {}: {bytes_in} bytes in, {bytes_out} bytes out", planned.label());
        reports.push(StageReport::new(planned.label(), command, bytes_in, bytes_out, &result));
        if let Err(e) = result {
            failures.push((reports.len() - 1, e));
        }
    }

    let (bytes_written, result) = sink_result;
    reports.push(StageReport::new(
        "write sink".to_string(),
        sink_label.to_string(),
        bytes_written,
        bytes_written,
        &result,
    ));
    if let Err(e) = result {
        failures.push((reports.len() - 1, e));
    }

    Run {
        bytes_read,
        bytes_written,
        reports,
        failures,
    }
}

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation cancelled by user")
}

fn pump_source(
    source: &mut (dyn Read + Send),
    mut out: PipeWriter,
    running: &AtomicBool,
    on_progress: &mut (dyn FnMut(u64) + Send),
) -> (u64, io::Result<()>) {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        if !running.load(Ordering::SeqCst) {
            return (total, Err(cancelled_error()));
        }
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (total, Err(e)),
        };
        if let Err(e) = out.write_all(&buf[..n]) {
            return (total, Err(e));
        }
        total += n as u64;
        on_progress(total);
    }
    (total, out.finish())
}

fn drain_into(mut input: PipeReader, sink: &mut dyn Write, running: &AtomicBool) -> (u64, io::Result<()>) {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        if !running.load(Ordering::SeqCst) {
            return (total, Err(cancelled_error()));
        }
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };
        if let Err(e) = sink.write_all(&buf[..n]) {
            return (total, Err(e));
        }
        total += n as u64;
    }
    (total, sink.flush())
}

fn run_stage(
    planned: &PlannedStage,
    passphrase: Option<&Passphrase>,
    backend: Backend,
    input: PipeReader,
    output: PipeWriter,
) -> (u64, u64, io::Result<()>) {
    let mut input = Counted::new(input);
    let mut output = Counted::new(output);
    let result = match backend {
        Backend::Native => transform::run_native(planned, passphrase, &mut input, &mut output),
        Backend::External => run_external(planned, passphrase, &mut input, &mut output),
    };
    let (bytes_in, bytes_out) = (input.count, output.count);
    // Only a successful stage signals end-of-stream; a failed one just drops its pipes.
    let result = result.and_then(|()| output.inner.finish());
    (bytes_in, bytes_out, result)
}

fn run_external(
    planned: &PlannedStage,
    passphrase: Option<&Passphrase>,
    input: &mut (dyn Read + Send),
    output: &mut dyn Write,
) -> io::Result<()> {
    let spec = planned.stage.command(planned.direction);
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if spec.needs_passphrase {
        let passphrase = passphrase.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "cipher stage requires a passphrase")
        })?;
        command.env(PASSPHRASE_ENV, passphrase.expose());
    }

    log::debug!("Spawning {spec}");
    let mut child = command.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => io::Error::new(e.kind(), format!("program '{}' not found", spec.program)),
        _ => e,
    })?;
    let missing = || io::Error::other("child process pipes unavailable");
    let mut stdin = child.stdin.take().ok_or_else(missing)?;
    let mut stdout = child.stdout.take().ok_or_else(missing)?;
    let mut stderr = child.stderr.take().ok_or_else(missing)?;

    let (fed, copied, diagnostics) = thread::scope(|scope| {
        let feeder = scope.spawn(move || -> io::Result<()> {
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                let n = input.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                if stdin.write_all(&buf[..n]).is_err() {
                    // The child stopped reading; its exit status says why.
                    return Ok(());
                }
            }
        });
        let errors = scope.spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        });

        let copied = io::copy(&mut stdout, output);
        if copied.is_err() {
            // Unblocks the feeder if the child stopped reading.
            let _ = child.kill();
        }
        drop(stdout);
        let fed = feeder.join().unwrap_or_else(|_| Err(io::Error::other("feeder panicked")));
        if fed.is_err() {
            let _ = child.kill();
        }
        let diagnostics = errors.join().unwrap_or_default();
        (fed, copied, diagnostics)
    });

    let status = child.wait()?;
    fed?;
    copied?;
    if !status.success() {
        let detail = diagnostics.trim();
        return Err(io::Error::other(if detail.is_empty() {
            format!("{} exited with {status}", spec.program)
        } else {
            format!("{} exited with {status}: {detail}", spec.program)
        }));
    }
    Ok(())
}
