//! The `.himg` filename convention.
//!
//! An artifact name records the stages applied to it, in application order,
//! left to right: `<base>.himg[.<encryption-ext>][.<compression-ext>]`.
//! Decoding strips suffixes from the right against a fixed extension table and
//! fails closed on anything the table does not describe.
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::stage::{Compression, Encryption, StageKind, TransformStage};

/// The base marker every artifact name carries before its stage suffixes.
pub const BASE_MARKER: &str = ".himg";

/// Stages that may follow the marker, in the order they are applied during create.
const APPLICATION_ORDER: [StageKind; 2] = [StageKind::Encryption, StageKind::Compression];

/// The result of decoding an artifact filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedName {
    /// The name before `.himg`.
    pub base: String,
    /// Stages in application order.
    pub stages: Vec<TransformStage>,
}

fn table(kind: StageKind) -> Vec<(&'static str, TransformStage)> {
    match kind {
        StageKind::Compression => Compression::ALL
            .into_iter()
            .map(|c| (c.extension(), TransformStage::Compression(c)))
            .collect(),
        StageKind::Encryption => Encryption::ALL
            .into_iter()
            .map(|e| (e.extension(), TransformStage::Encryption(e)))
            .collect(),
    }
}

/// Appends the marker and each stage's extension to `base`.
///
/// A base that already ends in `.himg` does not get a second marker.
pub fn encode(base: &str, stages: &[TransformStage]) -> String {
    let mut name = base.strip_suffix(BASE_MARKER).unwrap_or(base).to_string();
    name.push_str(BASE_MARKER);
    for stage in stages {
        name.push('.');
        name.push_str(stage.extension());
    }
    name
}

/// Like [`encode`], keeping the directory part of `base`.
pub fn encode_path(base: &Path, stages: &[TransformStage]) -> PathBuf {
    let file_name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(encode(&file_name, stages))
}

/// Recovers the base name and applied stages from an artifact filename.
///
/// Only the final path component is considered. Suffixes are stripped from the
/// right: the outermost stage (compression) is tried first, then encryption,
/// each at most once, taking the longest matching extension. What remains must
/// end in `.himg`.
pub fn decode(filename: &str) -> Result<DecodedName> {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());

    let mut remaining = name.as_str();
    let mut stripped = Vec::new();

    for kind in APPLICATION_ORDER.iter().rev() {
        if let Some((rest, stage)) = strip_longest(remaining, &table(*kind)) {
            remaining = rest;
            stripped.push(stage);
        }
    }

    let base = remaining
        .strip_suffix(BASE_MARKER)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| Error::UnrecognizedFormat(name.clone()))?;

    stripped.reverse();
    log::debug!("Decoded '{name}' as base '{base}' with {} stage(s)", stripped.len());
    Ok(DecodedName {
        base: base.to_string(),
        stages: stripped,
    })
}

fn strip_longest<'a>(name: &'a str, table: &[(&'static str, TransformStage)]) -> Option<(&'a str, TransformStage)> {
    table
        .iter()
        .filter_map(|(ext, stage)| {
            let rest = name.strip_suffix(ext)?.strip_suffix('.')?;
            Some((rest, *stage, ext.len()))
        })
        .max_by_key(|(_, _, len)| *len)
        .map(|(rest, stage, _)| (rest, stage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GZ: TransformStage = TransformStage::Compression(Compression::Gzip);
    const XZ: TransformStage = TransformStage::Compression(Compression::Xz);
    const AES: TransformStage = TransformStage::Encryption(Encryption::Aes256Cbc);
    const CHACHA: TransformStage = TransformStage::Encryption(Encryption::ChaCha20);

    #[test]
    fn encodes_in_application_order() {
        assert_eq!(encode("backup", &[GZ]), "backup.himg.gz");
        assert_eq!(encode("backup", &[AES, XZ]), "backup.himg.aes256.xz");
        assert_eq!(encode("backup.himg", &[CHACHA]), "backup.himg.chacha20");
        assert_eq!(encode("backup", &[]), "backup.himg");
    }

    #[test]
    fn decodes_gzip_scenario() {
        let decoded = decode("backup.himg.gz").unwrap();
        assert_eq!(decoded.base, "backup");
        assert_eq!(decoded.stages, vec![GZ]);
    }

    #[test]
    fn decodes_full_path_by_file_name() {
        let decoded = decode("/srv/images/sda1.himg.aes256.xz").unwrap();
        assert_eq!(decoded.base, "sda1");
        assert_eq!(decoded.stages, vec![AES, XZ]);
    }

    #[test]
    fn dotted_base_names_survive() {
        let decoded = decode("host.2024-01-01.himg.zst").unwrap();
        assert_eq!(decoded.base, "host.2024-01-01");
    }

    #[test]
    fn unknown_names_fail_closed() {
        for name in [
            "image.unknown",
            "image.img.gz",
            "backup.himg.gz.gz",
            "backup.himg.xz.aes256",
            "backup.himg.aes256.chacha20",
            "backup.himg.bz2",
            ".himg.gz",
            "backup.himg.gz.incomplete",
        ] {
            assert!(
                matches!(decode(name), Err(Error::UnrecognizedFormat(_))),
                "{name} should not decode"
            );
        }
    }

    #[test]
    fn encode_path_keeps_directory() {
        let path = encode_path(Path::new("/tmp/out/backup_sda1"), &[GZ]);
        assert_eq!(path, PathBuf::from("/tmp/out/backup_sda1.himg.gz"));
    }

    fn stage_sets() -> impl Strategy<Value = Vec<TransformStage>> {
        let enc = prop_oneof![Just(None), Just(Some(AES)), Just(Some(CHACHA))];
        let comp = prop_oneof![
            Just(None),
            Just(Some(GZ)),
            Just(Some(XZ)),
            Just(Some(TransformStage::Compression(Compression::Zstd)))
        ];
        (enc, comp).prop_map(|(e, c)| e.into_iter().chain(c).collect())
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(base in "[A-Za-z0-9_][A-Za-z0-9_.-]{0,24}", stages in stage_sets()) {
            prop_assume!(!base.ends_with(BASE_MARKER));
            let decoded = decode(&encode(&base, &stages)).unwrap();
            prop_assert_eq!(decoded.base, base);
            prop_assert_eq!(decoded.stages, stages);
        }
    }
}
