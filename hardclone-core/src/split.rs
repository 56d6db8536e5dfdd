//! Split parts: naming, writing and reassembly.
//!
//! Part names follow GNU `split`'s auto-extending alphabetic suffixes so that a
//! plain lexical sort always yields the write order: `part_aa` … `part_yz`,
//! then `part_zaaa` … `part_zyzz`, then `part_zzaaaa` and so on.
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Separator between an artifact name and its part suffix.
pub const PART_PREFIX: &str = "part_";

const LETTERS: u64 = 26;

/// Returns the suffix (without `part_`) of the part at zero-based `index`.
pub fn part_suffix(index: u64) -> String {
    let mut index = index;
    let mut level = 0usize;
    loop {
        // Names at this level: a leading letter from a..=y, then level+1 free letters.
        let free = level as u32 + 1;
        let count = 25 * LETTERS.pow(free);
        if index < count {
            let mut suffix = "z".repeat(level);
            let mut digits = vec![0u8; free as usize + 1];
            let mut rest = index;
            for slot in digits.iter_mut().rev() {
                *slot = (rest % LETTERS) as u8;
                rest /= LETTERS;
            }
            suffix.extend(digits.into_iter().map(|d| (b'a' + d) as char));
            return suffix;
        }
        index -= count;
        level += 1;
    }
}

/// The path of the part at `index` for the artifact `artifact`.
pub fn part_path(artifact: &Path, index: u64) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(format!(".{PART_PREFIX}{}", part_suffix(index)));
    PathBuf::from(name)
}

/// Strips a `.part_xx` suffix, if present, returning the artifact path.
pub fn strip_part_suffix(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let (artifact, suffix) = name.rsplit_once(&format!(".{PART_PREFIX}"))?;
    if suffix.len() >= 2 && suffix.bytes().all(|b| b.is_ascii_lowercase()) && !artifact.is_empty() {
        Some(path.with_file_name(artifact))
    } else {
        None
    }
}

/// Finds the part files of `artifact`, sorted lexically.
pub fn discover_parts(artifact: &Path) -> Result<Vec<PathBuf>> {
    let dir = match artifact.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = artifact
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::FileNotFound(artifact.to_path_buf()))?;

    let mut parts = Vec::new();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(parts),
        Err(e) => return Err(e.into()),
    };
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if strip_part_suffix(&path).is_some_and(|a| a.file_name().and_then(|n| n.to_str()) == Some(file_name)) {
            parts.push(dir.join(entry.file_name()));
        }
    }
    parts.sort();
    Ok(parts)
}

/// Appended to every output file while it is being written.
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";

pub(crate) fn incomplete_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(INCOMPLETE_SUFFIX);
    PathBuf::from(name)
}

/// A sink that writes either one file or a sequence of fixed-size parts.
///
/// Every file is written under a `.incomplete` name; [`OutputWriter::commit`]
/// renames them to their final names once the whole stream is known good.
pub(crate) struct OutputWriter {
    artifact: PathBuf,
    chunk_size: Option<u64>,
    current: Option<BufWriter<File>>,
    in_current: u64,
    finals: Vec<PathBuf>,
}

impl OutputWriter {
    pub(crate) fn new(artifact: &Path, chunk_size: Option<u64>) -> Result<Self> {
        let mut writer = Self {
            artifact: artifact.to_path_buf(),
            chunk_size,
            current: None,
            in_current: 0,
            finals: Vec::new(),
        };
        if chunk_size.is_none() {
            writer.open_next()?;
        }
        Ok(writer)
    }

    fn open_next(&mut self) -> io::Result<()> {
        self.close_current()?;
        let final_path = match self.chunk_size {
            Some(_) => part_path(&self.artifact, self.finals.len() as u64),
            None => self.artifact.clone(),
        };
        let file = File::create(incomplete_path(&final_path))?;
        log::debug!("Opened output {}", final_path.display());
        self.current = Some(BufWriter::new(file));
        self.in_current = 0;
        self.finals.push(final_path);
        Ok(())
    }

    fn close_current(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.current.take() {
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Flushes everything and moves each file to its final name.
    pub(crate) fn commit(mut self) -> io::Result<Vec<PathBuf>> {
        // An empty stream still yields one (empty) part.
        if self.finals.is_empty() {
            self.open_next()?;
        }
        self.close_current()?;
        for path in &self.finals {
            fs::rename(incomplete_path(path), path)?;
        }
        Ok(std::mem::take(&mut self.finals))
    }

    /// Closes the files and leaves them under their `.incomplete` names.
    pub(crate) fn abandon(mut self) -> Vec<PathBuf> {
        if let Err(e) = self.close_current() {
            log::warn!("Could not flush incomplete output: {e}");
        }
        self.finals.iter().map(|p| incomplete_path(p)).collect()
    }
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let limit = match self.chunk_size {
            Some(size) => {
                if self.current.is_none() || self.in_current >= size {
                    self.open_next()?;
                }
                (size - self.in_current).min(buf.len() as u64) as usize
            }
            None => buf.len(),
        };
        let n = match self.current.as_mut() {
            Some(w) => w.write(&buf[..limit])?,
            None => return Err(io::Error::other("output already closed")),
        };
        self.in_current += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Reads a list of files back to back as one stream.
pub struct PartReader {
    parts: std::vec::IntoIter<PathBuf>,
    current: Option<File>,
}

impl PartReader {
    pub fn open(parts: Vec<PathBuf>) -> Result<Self> {
        if let Some(missing) = parts.iter().find(|p| !p.is_file()) {
            return Err(Error::FileNotFound(missing.clone()));
        }
        Ok(Self {
            parts: parts.into_iter(),
            current: None,
        })
    }
}

impl Read for PartReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.current.is_none() {
                match self.parts.next() {
                    Some(path) => self.current = Some(File::open(path)?),
                    None => return Ok(0),
                }
            }
            if let Some(file) = self.current.as_mut() {
                let n = file.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
                self.current = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn suffixes_follow_gnu_split() {
        assert_eq!(part_suffix(0), "aa");
        assert_eq!(part_suffix(1), "ab");
        assert_eq!(part_suffix(25), "az");
        assert_eq!(part_suffix(26), "ba");
        assert_eq!(part_suffix(649), "yz");
        assert_eq!(part_suffix(650), "zaaa");
        assert_eq!(part_suffix(650 + 25 * 26 * 26 - 1), "zyzz");
        assert_eq!(part_suffix(650 + 25 * 26 * 26), "zzaaaa");
    }

    #[test]
    fn suffixes_sort_in_write_order() {
        let names: Vec<String> = (0..20_000).map(part_suffix).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn part_suffix_is_recognised_and_stripped() {
        let part = PathBuf::from("/x/backup.himg.gz.part_ab");
        assert_eq!(strip_part_suffix(&part), Some(PathBuf::from("/x/backup.himg.gz")));
        assert_eq!(strip_part_suffix(Path::new("/x/backup.himg.gz")), None);
        assert_eq!(strip_part_suffix(Path::new("/x/backup.part_A1")), None);
    }

    fn write_split(dir: &Path, data: &[u8], chunk: u64) -> Vec<PathBuf> {
        let artifact = dir.join("img.himg");
        let mut writer = OutputWriter::new(&artifact, Some(chunk)).unwrap();
        // Odd write sizes exercise chunk boundaries inside one write.
        for piece in data.chunks(7) {
            writer.write_all(piece).unwrap();
        }
        writer.commit().unwrap()
    }

    #[test]
    fn split_writes_ceil_n_over_c_parts() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let parts = write_split(dir.path(), &data, 300);
        assert_eq!(parts.len(), 4);
        assert_eq!(fs::metadata(&parts[3]).unwrap().len(), 100);
        assert!(parts[0].to_string_lossy().ends_with("img.himg.part_aa"));

        let found = discover_parts(&dir.path().join("img.himg")).unwrap();
        assert_eq!(found, parts);
    }

    #[test]
    fn empty_stream_still_writes_one_part() {
        let dir = tempdir().unwrap();
        let parts = write_split(dir.path(), &[], 1024);
        assert_eq!(parts, vec![dir.path().join("img.himg.part_aa")]);
        assert_eq!(fs::metadata(&parts[0]).unwrap().len(), 0);
        assert_eq!(discover_parts(&dir.path().join("img.himg")).unwrap(), parts);
    }

    #[test]
    fn incomplete_outputs_keep_their_marker() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("img.himg.gz");
        let mut writer = OutputWriter::new(&artifact, None).unwrap();
        writer.write_all(b"partial").unwrap();
        let left = writer.abandon();
        assert_eq!(left, vec![dir.path().join("img.himg.gz.incomplete")]);
        assert!(!artifact.exists());
        assert!(left[0].exists());
    }

    #[test]
    fn missing_part_is_reported() {
        let err = PartReader::open(vec![PathBuf::from("/nonexistent/a.part_aa")]).err().unwrap();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn lexical_concatenation_reproduces_stream(
            data in proptest::collection::vec(any::<u8>(), 1..5000),
            chunk in 1u64..700,
        ) {
            let dir = tempdir().unwrap();
            let parts = write_split(dir.path(), &data, chunk);
            prop_assert_eq!(parts.len() as u64, (data.len() as u64).div_ceil(chunk));

            let mut found = discover_parts(&dir.path().join("img.himg")).unwrap();
            found.sort();
            let mut joined = Vec::new();
            PartReader::open(found).unwrap().read_to_end(&mut joined).unwrap();
            prop_assert_eq!(joined, data);
        }
    }
}
