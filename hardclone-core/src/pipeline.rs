//! Turns a user's transform selection into an ordered, executable pipeline.
//!
//! Create always applies stages in one canonical order, encryption first and
//! compression second, whatever order they were selected in. That order fixes
//! both the stream composition and the filename suffix order. Restore runs the
//! stages it is given (listed in the order they were applied) backwards, so
//! the last-applied stage is undone first: `[encrypt, compress]` is restored
//! as `[decompress, decrypt]`.
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::stage::{Direction, Passphrase, PlannedStage, StageKind, TransformStage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Restore,
}

/// One user choice: a stage kind and the algorithm requested for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformSelection {
    pub kind: StageKind,
    pub algorithm: String,
}

impl TransformSelection {
    pub fn compression(algorithm: impl Into<String>) -> Self {
        Self {
            kind: StageKind::Compression,
            algorithm: algorithm.into(),
        }
    }

    pub fn encryption(algorithm: impl Into<String>) -> Self {
        Self {
            kind: StageKind::Encryption,
            algorithm: algorithm.into(),
        }
    }
}

impl From<TransformStage> for TransformSelection {
    fn from(stage: TransformStage) -> Self {
        Self {
            kind: stage.kind(),
            algorithm: stage.algorithm().to_string(),
        }
    }
}

/// Everything [`build`] needs to construct a [`PipelineSpec`].
///
/// For a restore, `selections` lists the stages in the order they were
/// applied when the artifact was created.
#[derive(Clone, Debug)]
pub struct PipelineRequest {
    pub operation: Operation,
    pub source: PathBuf,
    pub sink: PathBuf,
    pub selections: Vec<TransformSelection>,
    pub passphrase: Option<Passphrase>,
    /// Maximum size of each split part, e.g. `"1G"`. Create only.
    pub split_size: Option<String>,
    pub verify: bool,
    pub checksums: bool,
}

/// An immutable, fully validated pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSpec {
    pub operation: Operation,
    pub source: PathBuf,
    pub sink: PathBuf,
    /// Stages in execution order.
    pub stages: Vec<PlannedStage>,
    pub passphrase: Option<Passphrase>,
    pub split_chunk_size: Option<u64>,
    pub verify: bool,
    pub generate_checksums: bool,
}

impl PipelineSpec {
    /// The stages in the order they are (or were) applied to the raw stream,
    /// which is also the order of the filename suffixes.
    pub fn applied_stages(&self) -> Vec<TransformStage> {
        let stages = self.stages.iter().map(|p| p.stage);
        match self.operation {
            Operation::Create => stages.collect(),
            Operation::Restore => stages.rev().collect(),
        }
    }

    /// The restore pipeline that undoes this create pipeline, reading from
    /// `artifact` and writing to `destination`.
    pub fn inverse(&self, artifact: PathBuf, destination: PathBuf) -> PipelineSpec {
        PipelineSpec {
            operation: Operation::Restore,
            source: artifact,
            sink: destination,
            stages: plan_restore(&self.applied_stages()),
            passphrase: self.passphrase.clone(),
            split_chunk_size: None,
            verify: false,
            generate_checksums: false,
        }
    }
}

/// Canonical create order.
fn canonical_rank(kind: StageKind) -> u8 {
    match kind {
        StageKind::Encryption => 0,
        StageKind::Compression => 1,
    }
}

fn plan_restore(applied: &[TransformStage]) -> Vec<PlannedStage> {
    applied
        .iter()
        .rev()
        .map(|&stage| PlannedStage {
            stage,
            direction: Direction::Inverse,
        })
        .collect()
}

/// Validates `request` and constructs its [`PipelineSpec`].
///
/// # Errors
///
/// Fails with [`Error::InvalidSelection`] when an algorithm has no registered
/// stage, a stage kind is selected twice, a cipher is selected without a
/// passphrase, or the split size is missing, non-positive, unparsable or
/// requested for a restore.
pub fn build(request: &PipelineRequest) -> Result<PipelineSpec> {
    let mut stages = request
        .selections
        .iter()
        .map(|s| TransformStage::lookup(s.kind, &s.algorithm))
        .collect::<Result<Vec<_>>>()?;

    for kind in [StageKind::Compression, StageKind::Encryption] {
        if stages.iter().filter(|s| s.kind() == kind).count() > 1 {
            return Err(Error::invalid(format!("at most one {kind} stage may be selected")));
        }
    }

    let needs_passphrase = stages.iter().any(TransformStage::requires_passphrase);
    match &request.passphrase {
        Some(p) if needs_passphrase && p.expose().is_empty() => {
            return Err(Error::invalid("the passphrase must not be empty"));
        }
        None if needs_passphrase => {
            return Err(Error::invalid("an encryption stage was selected without a passphrase"));
        }
        _ => {}
    }

    if request.source == request.sink {
        return Err(Error::invalid(format!(
            "source and destination are the same path: {}",
            request.source.display()
        )));
    }

    let planned = match request.operation {
        Operation::Create => {
            stages.sort_by_key(|s| canonical_rank(s.kind()));
            stages
                .into_iter()
                .map(|stage| PlannedStage {
                    stage,
                    direction: Direction::Forward,
                })
                .collect()
        }
        Operation::Restore => {
            if request.split_size.is_some() {
                return Err(Error::invalid("splitting applies to image creation only"));
            }
            plan_restore(&stages)
        }
    };

    let split_chunk_size = request.split_size.as_deref().map(parse_size).transpose()?;

    let spec = PipelineSpec {
        operation: request.operation,
        source: request.source.clone(),
        sink: request.sink.clone(),
        stages: planned,
        passphrase: request.passphrase.clone().filter(|_| needs_passphrase),
        split_chunk_size,
        verify: request.verify,
        generate_checksums: request.checksums,
    };
    log::debug!(
        "Built {:?} pipeline: [{}]",
        spec.operation,
        spec.stages.iter().map(PlannedStage::label).collect::<Vec<_>>().join(" -> ")
    );
    Ok(spec)
}

/// Parses a size such as `1G`, `500M`, `2048K`, `2000MiB` or `4096`.
///
/// Multipliers are powers of 1024. The result must be positive.
pub fn parse_size(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(digits_end);

    let invalid = || Error::invalid(format!("'{text}' is not a valid size (e.g. 1G, 500M, 2048K)"));
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let unit = unit.trim().to_ascii_uppercase();
    let unit = unit
        .strip_suffix("IB")
        .or_else(|| unit.strip_suffix('B'))
        .unwrap_or(&unit);
    let multiplier: u64 = match unit {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => return Err(invalid()),
    };

    let size = value.checked_mul(multiplier).ok_or_else(invalid)?;
    if size == 0 {
        return Err(Error::invalid(format!("size '{text}' must be greater than zero")));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Compression, Encryption};

    fn request(operation: Operation, selections: Vec<TransformSelection>) -> PipelineRequest {
        PipelineRequest {
            operation,
            source: PathBuf::from("/dev/sdx1"),
            sink: PathBuf::from("/tmp/backup"),
            selections,
            passphrase: Some(Passphrase::new("secret")),
            split_size: None,
            verify: false,
            checksums: false,
        }
    }

    fn labels(spec: &PipelineSpec) -> Vec<String> {
        spec.stages.iter().map(PlannedStage::label).collect()
    }

    #[test]
    fn create_uses_canonical_order_regardless_of_selection_order() {
        let spec = build(&request(
            Operation::Create,
            vec![TransformSelection::compression("xz"), TransformSelection::encryption("aes256")],
        ))
        .unwrap();
        assert_eq!(labels(&spec), ["encrypt:aes-256-cbc", "compress:xz"]);
        assert_eq!(
            spec.applied_stages(),
            vec![
                TransformStage::Encryption(Encryption::Aes256Cbc),
                TransformStage::Compression(Compression::Xz)
            ]
        );
    }

    #[test]
    fn restore_reverses_create_order() {
        let selections = vec![TransformSelection::encryption("chacha20"), TransformSelection::compression("zstd")];
        let create = build(&request(Operation::Create, selections.clone())).unwrap();
        let restore = build(&request(Operation::Restore, selections)).unwrap();
        assert_eq!(labels(&restore), ["decompress:zstd", "decrypt:chacha20"]);

        let forward: Vec<_> = create.stages.iter().map(|p| p.stage).collect();
        let mut backward: Vec<_> = restore.stages.iter().map(|p| p.stage).collect();
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(create.applied_stages(), restore.applied_stages());
    }

    #[test]
    fn inverse_of_create_matches_restore_build() {
        let selections = vec![TransformSelection::encryption("aes"), TransformSelection::compression("gz")];
        let create = build(&request(Operation::Create, selections)).unwrap();
        let inverse = create.inverse(PathBuf::from("/tmp/backup.himg.aes256.gz"), PathBuf::from("/dev/null"));
        assert_eq!(labels(&inverse), ["decompress:gzip", "decrypt:aes-256-cbc"]);
        assert_eq!(inverse.passphrase, create.passphrase);
    }

    #[test]
    fn unknown_algorithm_is_invalid() {
        let err = build(&request(Operation::Create, vec![TransformSelection::compression("rar")])).unwrap_err();
        assert!(matches!(err, Error::InvalidSelection(_)));
    }

    #[test]
    fn duplicate_kinds_are_invalid() {
        let err = build(&request(
            Operation::Create,
            vec![TransformSelection::compression("gz"), TransformSelection::compression("xz")],
        ))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSelection(_)));
    }

    #[test]
    fn encryption_requires_passphrase() {
        let mut req = request(Operation::Create, vec![TransformSelection::encryption("aes256")]);
        req.passphrase = None;
        assert!(matches!(build(&req), Err(Error::InvalidSelection(_))));
        req.passphrase = Some(Passphrase::new(""));
        assert!(matches!(build(&req), Err(Error::InvalidSelection(_))));
    }

    #[test]
    fn passphrase_is_dropped_when_nothing_is_encrypted() {
        let spec = build(&request(Operation::Create, vec![TransformSelection::compression("gz")])).unwrap();
        assert_eq!(spec.passphrase, None);
    }

    #[test]
    fn split_size_is_validated() {
        let mut req = request(Operation::Create, vec![]);
        req.split_size = Some("2000MiB".into());
        assert_eq!(build(&req).unwrap().split_chunk_size, Some(2000 * 1024 * 1024));

        for bad in ["0", "-1G", "abc", "10X", "", "99999999999T"] {
            req.split_size = Some(bad.into());
            assert!(matches!(build(&req), Err(Error::InvalidSelection(_))), "{bad}");
        }

        let mut restore = request(Operation::Restore, vec![]);
        restore.split_size = Some("1G".into());
        assert!(build(&restore).is_err());
    }

    #[test]
    fn sizes_parse_like_split() {
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_size("500M").unwrap(), 500 << 20);
        assert_eq!(parse_size("2048K").unwrap(), 2048 << 10);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size(" 2 gb ").unwrap(), 2 << 30);
    }

    #[test]
    fn same_source_and_sink_is_rejected() {
        let mut req = request(Operation::Create, vec![]);
        req.sink = req.source.clone();
        assert!(matches!(build(&req), Err(Error::InvalidSelection(_))));
    }
}
