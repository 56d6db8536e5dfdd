//! The files produced by a create operation.
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::naming::{self, DecodedName};
use crate::split::{self, PartReader};
use crate::verify::{self, MD5_EXTENSION, SHA256_EXTENSION};

/// An image on disk: one file, or an ordered set of split parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageArtifact {
    /// The logical artifact name, e.g. `backup.himg.aes256.xz`. For a split
    /// artifact this file does not itself exist.
    pub path: PathBuf,
    /// Part files in lexical (= write) order; empty for a single file.
    pub parts: Vec<PathBuf>,
}

impl ImageArtifact {
    pub(crate) fn from_outputs(path: &Path, outputs: Vec<PathBuf>, split: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            parts: if split { outputs } else { Vec::new() },
        }
    }

    /// Locates an artifact given its logical name or the name of one of its parts.
    pub fn discover(path: &Path) -> Result<Self> {
        let logical = split::strip_part_suffix(path).unwrap_or_else(|| path.to_path_buf());
        let parts = split::discover_parts(&logical)?;
        if logical.is_file() {
            if !parts.is_empty() {
                return Err(Error::invalid(format!(
                    "both {} and {} split part(s) of it exist; remove the stale copy",
                    logical.display(),
                    parts.len()
                )));
            }
            return Ok(Self {
                path: logical,
                parts: Vec::new(),
            });
        }

        if parts.is_empty() {
            return Err(Error::FileNotFound(logical));
        }
        log::debug!("Found {} part(s) of {}", parts.len(), logical.display());
        Ok(Self { path: logical, parts })
    }

    /// Files an earlier create left under the logical name `logical`: the
    /// single-file artifact, its split parts and the sidecars of each.
    pub fn existing_outputs(logical: &Path) -> Result<Vec<PathBuf>> {
        let mut holders = vec![logical.to_path_buf()];
        holders.extend(split::discover_parts(logical)?);

        let mut found = Vec::new();
        for holder in holders {
            let sha = verify::sidecar_path(&holder, SHA256_EXTENSION);
            let md5 = verify::sidecar_path(&holder, MD5_EXTENSION);
            found.extend([holder, sha, md5].into_iter().filter(|p| p.is_file()));
        }
        Ok(found)
    }

    /// Deletes everything [`ImageArtifact::existing_outputs`] reports.
    pub(crate) fn remove_existing(logical: &Path) -> Result<usize> {
        let stale = Self::existing_outputs(logical)?;
        for path in &stale {
            fs::remove_file(path)?;
            log::warn!("Removed previous output {}", path.display());
        }
        Ok(stale.len())
    }

    pub fn is_split(&self) -> bool {
        !self.parts.is_empty()
    }

    /// The files holding the artifact's bytes, in stream order.
    pub fn files(&self) -> Vec<&Path> {
        if self.is_split() {
            self.parts.iter().map(PathBuf::as_path).collect()
        } else {
            vec![self.path.as_path()]
        }
    }

    /// Total artifact size in bytes across all files.
    pub fn len(&self) -> Result<u64> {
        let mut total = 0;
        for file in self.files() {
            total += fs::metadata(file)
                .map_err(|_| Error::FileNotFound(file.to_path_buf()))?
                .len();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Opens the artifact as one logical byte stream.
    pub fn open(&self) -> Result<PartReader> {
        PartReader::open(self.files().into_iter().map(Path::to_path_buf).collect())
    }

    /// Decodes the artifact name into its base name and applied stages.
    pub fn decode_name(&self) -> Result<DecodedName> {
        naming::decode(&self.path.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn discovers_split_artifact_from_any_part() {
        let dir = tempdir().unwrap();
        let logical = dir.path().join("backup.himg.gz");
        for (suffix, body) in [("part_ab", "world"), ("part_aa", "hello ")] {
            fs::write(dir.path().join(format!("backup.himg.gz.{suffix}")), body).unwrap();
        }
        // Sidecars and unrelated files next to the parts are ignored.
        fs::write(dir.path().join("backup.himg.gz.part_aa.sha256"), "x").unwrap();
        fs::write(dir.path().join("other.himg.gz.part_aa"), "nope").unwrap();

        let artifact = ImageArtifact::discover(&dir.path().join("backup.himg.gz.part_ab")).unwrap();
        assert_eq!(artifact.path, logical);
        assert_eq!(artifact.parts.len(), 2);
        assert_eq!(artifact.len().unwrap(), 11);

        let mut joined = String::new();
        artifact.open().unwrap().read_to_string(&mut joined).unwrap();
        assert_eq!(joined, "hello world");
    }

    #[test]
    fn single_file_next_to_parts_is_ambiguous() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("backup.himg.xz"), "old").unwrap();
        fs::write(dir.path().join("backup.himg.xz.part_aa"), "new").unwrap();

        let err = ImageArtifact::discover(&dir.path().join("backup.himg.xz")).unwrap_err();
        assert!(matches!(err, Error::InvalidSelection(_)));
        let err = ImageArtifact::discover(&dir.path().join("backup.himg.xz.part_aa")).unwrap_err();
        assert!(matches!(err, Error::InvalidSelection(_)));
    }

    #[test]
    fn existing_outputs_cover_parts_and_sidecars() {
        let dir = tempdir().unwrap();
        let logical = dir.path().join("backup.himg");
        for name in [
            "backup.himg",
            "backup.himg.sha256",
            "backup.himg.part_aa",
            "backup.himg.part_aa.md5",
            "backup.himg.part_ab",
            "backup.himg.gz",
            "backup.himg.part_aa.incomplete",
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
        }

        let mut found = ImageArtifact::existing_outputs(&logical).unwrap();
        found.sort();
        let expected: Vec<PathBuf> = [
            "backup.himg",
            "backup.himg.part_aa",
            "backup.himg.part_aa.md5",
            "backup.himg.part_ab",
            "backup.himg.sha256",
        ]
        .iter()
        .map(|n| dir.path().join(n))
        .collect();
        assert_eq!(found, expected);

        assert_eq!(ImageArtifact::remove_existing(&logical).unwrap(), 5);
        assert!(ImageArtifact::existing_outputs(&logical).unwrap().is_empty());
        assert!(dir.path().join("backup.himg.gz").exists());
    }

    #[test]
    fn missing_artifact_is_file_not_found() {
        let dir = tempdir().unwrap();
        let err = ImageArtifact::discover(&dir.path().join("gone.himg")).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn single_file_artifact_decodes_its_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sda1.himg.chacha20.zst");
        fs::write(&path, b"bytes").unwrap();
        let artifact = ImageArtifact::discover(&path).unwrap();
        assert!(!artifact.is_split());
        assert_eq!(artifact.decode_name().unwrap().stages.len(), 2);
    }
}
