//! The core, UI-agnostic library for the `hardclone` imaging utility.
//!
//! `hardclone-core` turns a raw disk or partition into an image artifact by
//! streaming it through an ordered pipeline of reversible stages (encryption,
//! then compression), optionally splitting the output into parts, verifying it
//! and writing checksum sidecars. Restore runs the same stages backwards.
//!
//! The library is structured into several key modules:
//! - [`naming`]: The `<base>.himg[.enc][.comp]` filename convention, in both directions.
//! - [`pipeline`]: Turns a user selection into an ordered, validated [`pipeline::PipelineSpec`].
//! - [`executor`]: Runs a pipeline with every stage as its own unit of work.
//! - [`verify`]: Restore-and-compare verification and SHA-256/MD5 sidecars.
//! - [`controller`]: Orchestrates complete create and restore operations.
//! - [`platform`]: Lists disks and partitions and reports mount points.
//!
//! Front-ends usually only need [`controller::OperationController`]. It
//! reports progress through the [`controller::Observer`] trait, so the calling
//! application can display progress in any way it chooses.
//!
//! ## Example: Creating an Image with Progress Reporting
//!
//! ```rust,no_run
//! use hardclone_core::controller::{CreateRequest, Observer, OperationController, Phase};
//! use hardclone_core::executor::ExecutionOptions;
//! use hardclone_core::pipeline::TransformSelection;
//! use hardclone_core::stage::Passphrase;
//! use std::path::PathBuf;
//!
//! struct Printer;
//!
//! impl Observer for Printer {
//!     fn on_progress(&self, phase: Phase, bytes: u64) {
//!         println!("{phase:?}: {bytes} bytes");
//!     }
//! }
//!
//! fn main() -> hardclone_core::Result<()> {
//!     // Cleared from another thread (e.g. a Ctrl+C handler) to cancel.
//!     let options = ExecutionOptions::default();
//!
//!     let request = CreateRequest {
//!         source: PathBuf::from("/dev/sdb1"),
//!         output: PathBuf::from("/tmp/backup_sdb1"),
//!         selections: vec![
//!             TransformSelection::encryption("aes256"),
//!             TransformSelection::compression("zstd"),
//!         ],
//!         passphrase: Some(Passphrase::new("correct horse battery staple")),
//!         split_size: Some("1G".to_string()),
//!         verify: true,
//!         checksums: true,
//!     };
//!
//!     let mut controller = OperationController::new(options).with_observer(Printer);
//!     let outcome = controller.create(&request)?;
//!     println!("Wrote {}", outcome.artifact.path.display()); // /tmp/backup_sdb1.himg.aes256.zst
//!
//!     Ok(())
//! }
//! ```

pub mod artifact;
pub mod controller;
pub mod device;
pub mod error;
pub mod executor;
pub mod naming;
mod pipe;
pub mod pipeline;
pub mod platform;
pub mod rawio;
pub mod split;
pub mod stage;
mod transform;
pub mod verify;

pub use error::{Error, Result};
