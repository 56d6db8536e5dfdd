//! Post-create integrity checks: full restore-and-compare verification and
//! SHA-256/MD5 checksum sidecars.
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::artifact::ImageArtifact;
use crate::error::{Error, Result};
use crate::executor::{self, ExecutionOptions};
use crate::pipeline::{Operation, PipelineSpec};
use crate::rawio::{self, RawReader};
use crate::split;

const BUFFER_SIZE: usize = 1024 * 1024;

pub const SHA256_EXTENSION: &str = "sha256";
pub const MD5_EXTENSION: &str = "md5";

/// Outcome of a successful [`verify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    /// Bytes of restored stream compared against the source.
    pub bytes_compared: u64,
}

/// A write sink that compares everything written to it against `original`
/// and stops at the first differing byte.
struct CompareSink<R> {
    original: R,
    offset: u64,
    expected: Vec<u8>,
    mismatch: Option<u64>,
}

impl<R: Read> CompareSink<R> {
    fn new(original: R) -> Self {
        Self {
            original,
            offset: 0,
            expected: Vec::new(),
            mismatch: None,
        }
    }

    fn diverged(&mut self, at: u64) -> io::Error {
        self.mismatch = Some(at);
        io::Error::other(format!("restored stream differs from the source at byte {at}"))
    }

    /// Records a mismatch if the source still has bytes after the restored
    /// stream ended.
    fn check_exhausted(&mut self) -> io::Result<()> {
        if self.mismatch.is_none() {
            let mut probe = [0u8; 1];
            if read_full(&mut self.original, &mut probe)? > 0 {
                self.mismatch = Some(self.offset);
            }
        }
        Ok(())
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl<R: Read> Write for CompareSink<R> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.mismatch.is_some() {
            return Err(io::Error::other("comparison already failed"));
        }
        if self.expected.len() < data.len() {
            self.expected.resize(data.len(), 0);
        }
        let got = read_full(&mut self.original, &mut self.expected[..data.len()])?;
        let differing = data[..got]
            .iter()
            .zip(&self.expected[..got])
            .position(|(a, b)| a != b);
        if let Some(index) = differing {
            return Err(self.diverged(self.offset + index as u64));
        }
        if got < data.len() {
            // The restored stream is longer than the source.
            return Err(self.diverged(self.offset + got as u64));
        }
        self.offset += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Verifies that `artifact` restores to exactly the bytes of `spec.source`.
///
/// The inverse of the create pipeline `spec` is run over the artifact and its
/// output is compared byte by byte with the source as it streams, so nothing
/// is written anywhere.
///
/// # Errors
///
/// - [`Error::VerificationMismatch`] with the offset of the first differing
///   byte, or the length of the shorter stream when one is a prefix of the other.
/// - [`Error::VerificationError`] when a stage fails during the check.
/// - [`Error::Cancelled`] when `options.running` is cleared.
pub fn verify<F>(
    spec: &PipelineSpec,
    artifact: &ImageArtifact,
    options: &ExecutionOptions,
    on_start: impl FnOnce(u64),
    mut on_progress: F,
) -> Result<VerificationResult>
where
    F: FnMut(u64) + Send,
{
    if spec.operation != Operation::Create {
        return Err(Error::invalid("only a create pipeline can be verified"));
    }
    let inverse = spec.inverse(artifact.path.clone(), spec.source.clone());
    log::info!(
        "Verifying {} against {} ({} stage(s))",
        artifact.path.display(),
        spec.source.display(),
        inverse.stages.len()
    );

    let handle = rawio::probe(&spec.source)?;
    let original = RawReader::open(&handle, options.block_size)?;
    let mut reader = artifact.open()?;
    on_start(artifact.len()?);

    let mut compare = CompareSink::new(original);
    let run = executor::run_stages(
        &mut reader,
        &artifact.path,
        &inverse.stages,
        inverse.passphrase.as_ref(),
        &mut compare,
        "compare with source",
        options,
        &mut on_progress,
    );

    if let Some(offset) = compare.mismatch {
        log::warn!("Verification mismatch at byte {offset}");
        return Err(Error::VerificationMismatch(offset));
    }
    match run.outcome(options) {
        Ok(()) => {}
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => return Err(Error::VerificationError(e.to_string())),
    }
    compare
        .check_exhausted()
        .map_err(|e| Error::VerificationError(format!("reading source: {e}")))?;
    if let Some(offset) = compare.mismatch {
        log::warn!("Restored stream ends early at byte {offset}");
        return Err(Error::VerificationMismatch(offset));
    }

    log::info!("Verification succeeded: {} bytes identical", compare.offset);
    Ok(VerificationResult {
        bytes_compared: compare.offset,
    })
}

/// Digests of one file on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDigest {
    pub path: PathBuf,
    pub sha256: String,
    pub md5: String,
}

/// Digests of a whole artifact and of each file holding it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumReport {
    /// SHA-256 of the complete artifact byte stream.
    pub sha256: String,
    /// MD5 of the complete artifact byte stream.
    pub md5: String,
    pub files: Vec<FileDigest>,
    /// Sidecar files written, two per artifact file.
    pub sidecars: Vec<PathBuf>,
}

/// Path of the sidecar for `file` with the given digest extension.
pub fn sidecar_path(file: &Path, extension: &str) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sidecar_line(digest: &str, file: &Path) -> String {
    format!("{digest}  {}\n", file_name(file))
}

/// Writes both sidecars of every file under `.incomplete` names, then renames
/// them all. On failure every sidecar written so far is removed again.
fn write_sidecars(files: &[FileDigest], running: &AtomicBool) -> Result<Vec<PathBuf>> {
    let mut sidecars = Vec::with_capacity(files.len() * 2);
    for digest in files {
        sidecars.push((sidecar_path(&digest.path, SHA256_EXTENSION), sidecar_line(&digest.sha256, &digest.path)));
        sidecars.push((sidecar_path(&digest.path, MD5_EXTENSION), sidecar_line(&digest.md5, &digest.path)));
    }

    let mut written = Vec::with_capacity(sidecars.len() * 2);
    let result = (|| -> Result<()> {
        for (sidecar, line) in &sidecars {
            if !running.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let incomplete = split::incomplete_path(sidecar);
            fs::write(&incomplete, line)?;
            written.push(incomplete);
        }
        for (sidecar, _) in &sidecars {
            fs::rename(split::incomplete_path(sidecar), sidecar)?;
            written.push(sidecar.clone());
            log::debug!("Wrote {}", sidecar.display());
        }
        Ok(())
    })();

    if let Err(e) = result {
        for path in written.iter().filter(|p| p.is_file()) {
            if let Err(remove) = fs::remove_file(path) {
                log::warn!("Could not remove {}: {remove}", path.display());
            }
        }
        return Err(e);
    }
    Ok(sidecars.into_iter().map(|(sidecar, _)| sidecar).collect())
}

/// Computes SHA-256 and MD5 over the bytes of `artifact` as stored on disk and
/// writes `sha256sum`-style sidecars next to each of its files.
pub fn checksum(
    artifact: &ImageArtifact,
    running: &AtomicBool,
    on_start: impl FnOnce(u64),
    mut on_progress: impl FnMut(u64),
) -> Result<ChecksumReport> {
    on_start(artifact.len()?);

    let mut whole_sha = Sha256::new();
    let mut whole_md5 = Md5::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    let mut files = Vec::new();

    for path in artifact.files() {
        let mut reader = BufReader::new(File::open(path).map_err(|_| Error::FileNotFound(path.to_path_buf()))?);
        let mut sha = Sha256::new();
        let mut md5 = Md5::new();
        loop {
            if !running.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            let chunk = &buffer[..n];
            sha.update(chunk);
            md5.update(chunk);
            whole_sha.update(chunk);
            whole_md5.update(chunk);
            total += n as u64;
            on_progress(total);
        }
        files.push(FileDigest {
            path: path.to_path_buf(),
            sha256: hex::encode(sha.finalize()),
            md5: hex::encode(md5.finalize()),
        });
    }

    let sidecars = write_sidecars(&files, running)?;

    let report = ChecksumReport {
        sha256: hex::encode(whole_sha.finalize()),
        md5: hex::encode(whole_md5.finalize()),
        files,
        sidecars,
    };
    log::info!("SHA-256 of {}: {}", artifact.path.display(), report.sha256);
    Ok(report)
}

/// Extracts the digest from a `sha256sum`/`md5sum` line, if well formed.
fn parse_sidecar(text: &str, hex_len: usize) -> Option<Vec<u8>> {
    let digest = text.split_whitespace().next()?;
    if digest.len() != hex_len {
        return None;
    }
    hex::decode(digest).ok()
}

fn digest_file<D: Digest>(path: &Path) -> Result<Vec<u8>> {
    let mut reader = BufReader::new(File::open(path).map_err(|_| Error::FileNotFound(path.to_path_buf()))?);
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Finds the first artifact file whose sidecar disagrees with its contents.
///
/// Every present sidecar is checked. A file with neither a `.sha256` nor an
/// `.md5` sidecar fails with [`Error::FileNotFound`] naming the missing
/// `.sha256` file.
pub fn find_checksum_mismatch(artifact: &ImageArtifact) -> Result<Option<(PathBuf, &'static str)>> {
    for file in artifact.files() {
        let sha_sidecar = sidecar_path(file, SHA256_EXTENSION);
        let md5_sidecar = sidecar_path(file, MD5_EXTENSION);
        if !sha_sidecar.is_file() && !md5_sidecar.is_file() {
            log::warn!("No checksum sidecar for {}", file.display());
            return Err(Error::FileNotFound(sha_sidecar));
        }

        if sha_sidecar.is_file() {
            let matches = match parse_sidecar(&fs::read_to_string(&sha_sidecar)?, 64) {
                Some(expected) => expected == digest_file::<Sha256>(file)?,
                None => false,
            };
            if !matches {
                return Ok(Some((file.to_path_buf(), "SHA-256")));
            }
        }
        if md5_sidecar.is_file() {
            let matches = match parse_sidecar(&fs::read_to_string(&md5_sidecar)?, 32) {
                Some(expected) => expected == digest_file::<Md5>(file)?,
                None => false,
            };
            if !matches {
                return Ok(Some((file.to_path_buf(), "MD5")));
            }
        }
    }
    Ok(None)
}

/// Recomputes the digests of `artifact` and compares them with its sidecars.
///
/// Returns `false` when any sidecar disagrees or cannot be parsed.
pub fn check_checksum(artifact: &ImageArtifact) -> Result<bool> {
    let mismatch = find_checksum_mismatch(artifact)?;
    if let Some((path, algorithm)) = &mismatch {
        log::warn!("{algorithm} checksum mismatch for {}", path.display());
    }
    Ok(mismatch.is_none())
}
