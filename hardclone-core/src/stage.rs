//! Transform stage definitions.
//!
//! A [`TransformStage`] is one reversible byte-stream operation: a compression
//! codec or a passphrase-keyed cipher. Every stage knows its canonical filename
//! extension and how to resolve itself, for a given [`Direction`], into either
//! an in-process codec ([`Backend::Native`]) or an explicit external program
//! invocation ([`Backend::External`]).
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Name of the environment variable through which external cipher stages
/// receive the passphrase (`openssl enc -pass env:...`).
pub const PASSPHRASE_ENV: &str = "HARDCLONE_STAGE_PASSPHRASE";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Compression,
    Encryption,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Compression => f.write_str("compression"),
            StageKind::Encryption => f.write_str("encryption"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub const ALL: [Compression; 3] = [Compression::Gzip, Compression::Xz, Compression::Zstd];

    pub fn name(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        }
    }

    /// Canonical filename extension, without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Xz => "xz",
            Compression::Zstd => "zst",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Some(Compression::Gzip),
            "xz" | "lzma" => Some(Compression::Xz),
            "zstd" | "zst" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Encryption {
    Aes256Cbc,
    ChaCha20,
}

impl Encryption {
    pub const ALL: [Encryption; 2] = [Encryption::Aes256Cbc, Encryption::ChaCha20];

    pub fn name(self) -> &'static str {
        match self {
            Encryption::Aes256Cbc => "aes-256-cbc",
            Encryption::ChaCha20 => "chacha20",
        }
    }

    /// Canonical filename extension, without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Encryption::Aes256Cbc => "aes256",
            Encryption::ChaCha20 => "chacha20",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aes-256-cbc" | "aes256" | "aes-256" | "aes" => Some(Encryption::Aes256Cbc),
            "chacha20" | "chacha" => Some(Encryption::ChaCha20),
            _ => None,
        }
    }

    fn openssl_cipher(self) -> &'static str {
        match self {
            Encryption::Aes256Cbc => "-aes-256-cbc",
            Encryption::ChaCha20 => "-chacha20",
        }
    }
}

/// A single reversible operation applied to a byte stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransformStage {
    Compression(Compression),
    Encryption(Encryption),
}

impl TransformStage {
    pub fn kind(&self) -> StageKind {
        match self {
            TransformStage::Compression(_) => StageKind::Compression,
            TransformStage::Encryption(_) => StageKind::Encryption,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            TransformStage::Compression(c) => c.name(),
            TransformStage::Encryption(e) => e.name(),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TransformStage::Compression(c) => c.extension(),
            TransformStage::Encryption(e) => e.extension(),
        }
    }

    /// Looks up a registered stage of the given kind by algorithm name.
    pub fn lookup(kind: StageKind, algorithm: &str) -> Result<Self> {
        let found = match kind {
            StageKind::Compression => Compression::parse(algorithm).map(TransformStage::Compression),
            StageKind::Encryption => Encryption::parse(algorithm).map(TransformStage::Encryption),
        };
        found.ok_or_else(|| {
            Error::invalid(format!("no {kind} stage is registered for algorithm '{algorithm}'"))
        })
    }

    pub fn requires_passphrase(&self) -> bool {
        self.kind() == StageKind::Encryption
    }

    /// Resolves the stage into an external program invocation.
    ///
    /// Arguments are passed as a list, never through a shell, and the
    /// passphrase is handed over in the child's environment.
    pub fn command(&self, direction: Direction) -> StageCommand {
        let inverse = direction == Direction::Inverse;
        match self {
            TransformStage::Compression(c) => {
                let program = match c {
                    Compression::Gzip => "gzip",
                    Compression::Xz => "xz",
                    Compression::Zstd => "zstd",
                };
                let mut args = vec![if inverse { "-dc" } else { "-c" }];
                match c {
                    Compression::Xz if !inverse => args.push("-T0"),
                    Compression::Zstd => args.push("-q"),
                    _ => {}
                }
                StageCommand::new(program, args, false)
            }
            TransformStage::Encryption(e) => {
                let pass = format!("env:{PASSPHRASE_ENV}");
                let args = ["enc", e.openssl_cipher(), "-salt", "-pbkdf2", "-pass", pass.as_str()];
                let mut cmd = StageCommand::new("openssl", args, true);
                if inverse {
                    cmd.args.push("-d".to_string());
                }
                cmd
            }
        }
    }
}

impl fmt::Display for TransformStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.algorithm())
    }
}

/// Whether a stage is being applied (create) or undone (restore).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Inverse,
}

/// A stage bound to the direction it runs in within a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlannedStage {
    pub stage: TransformStage,
    pub direction: Direction,
}

impl PlannedStage {
    /// A short human-readable label such as `compress:gzip` or `decrypt:chacha20`.
    pub fn label(&self) -> String {
        let verb = match (self.stage.kind(), self.direction) {
            (StageKind::Compression, Direction::Forward) => "compress",
            (StageKind::Compression, Direction::Inverse) => "decompress",
            (StageKind::Encryption, Direction::Forward) => "encrypt",
            (StageKind::Encryption, Direction::Inverse) => "decrypt",
        };
        format!("{verb}:{}", self.stage.algorithm())
    }
}

/// Selects how stages are executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    /// In-process streaming codecs.
    #[default]
    Native,
    /// One external program per stage (`gzip`, `xz`, `zstd`, `openssl`).
    External,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Backend::Native),
            "external" => Ok(Backend::External),
            other => Err(Error::invalid(format!(
                "unknown backend '{other}' (expected 'native' or 'external')"
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Native => f.write_str("native"),
            Backend::External => f.write_str("external"),
        }
    }
}

/// An explicit external program invocation for one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Whether the passphrase must be exported as [`PASSPHRASE_ENV`].
    pub needs_passphrase: bool,
}

impl StageCommand {
    fn new<'a>(program: &str, args: impl IntoIterator<Item = &'a str>, needs_passphrase: bool) -> Self {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(str::to_string).collect(),
            needs_passphrase,
        }
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A user passphrase. Its `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_accepts_aliases() {
        assert_eq!(
            TransformStage::lookup(StageKind::Compression, "GZ").unwrap(),
            TransformStage::Compression(Compression::Gzip)
        );
        assert_eq!(
            TransformStage::lookup(StageKind::Encryption, "aes256").unwrap(),
            TransformStage::Encryption(Encryption::Aes256Cbc)
        );
    }

    #[test]
    fn lookup_rejects_unregistered_algorithm() {
        let err = TransformStage::lookup(StageKind::Compression, "bzip2").unwrap_err();
        assert!(matches!(err, Error::InvalidSelection(_)));
        // A cipher name is not a compression algorithm.
        assert!(TransformStage::lookup(StageKind::Compression, "chacha20").is_err());
    }

    #[test]
    fn external_commands_never_carry_the_passphrase() {
        let stage = TransformStage::Encryption(Encryption::Aes256Cbc);
        let cmd = stage.command(Direction::Inverse);
        assert_eq!(cmd.program, "openssl");
        assert_eq!(
            cmd.args,
            ["enc", "-aes-256-cbc", "-salt", "-pbkdf2", "-pass", "env:HARDCLONE_STAGE_PASSPHRASE", "-d"]
        );
        assert!(cmd.needs_passphrase);

        let gz = TransformStage::Compression(Compression::Gzip).command(Direction::Forward);
        assert_eq!(gz.to_string(), "gzip -c");
        let zst = TransformStage::Compression(Compression::Zstd).command(Direction::Inverse);
        assert_eq!(zst.to_string(), "zstd -dc -q");
    }

    #[test]
    fn labels_name_the_direction() {
        let planned = PlannedStage {
            stage: TransformStage::Compression(Compression::Xz),
            direction: Direction::Inverse,
        };
        assert_eq!(planned.label(), "decompress:xz");
    }

    #[test]
    fn passphrase_debug_is_redacted() {
        let p = Passphrase::new("hunter2");
        assert!(!format!("{p:?}").contains("hunter2"));
    }
}
