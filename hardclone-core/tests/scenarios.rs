//! End-to-end create/verify/restore runs over synthetic device images.
use hardclone_core::Error;
use hardclone_core::artifact::ImageArtifact;
use hardclone_core::controller::{CreateRequest, OperationController, RestoreRequest};
use hardclone_core::executor::{self, ConfirmationToken, ExecutionOptions};
use hardclone_core::naming;
use hardclone_core::pipeline::{self, Operation, PipelineRequest, TransformSelection};
use hardclone_core::stage::{Compression, Passphrase, TransformStage};
use hardclone_core::verify;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// A compressible but non-trivial synthetic disk image.
fn synthetic_image(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|i| {
            if (i / 4096) % 3 == 0 {
                0
            } else {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state % 16) as u8
            }
        })
        .collect()
}

fn write_source(dir: &Path, len: usize) -> Vec<u8> {
    let data = synthetic_image(len);
    fs::write(dir.join("device.img"), &data).unwrap();
    data
}

#[test]
fn gzip_image_is_named_decoded_and_verified() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), 4 * 1024 * 1024);

    let mut controller = OperationController::new(ExecutionOptions::default());
    let outcome = controller
        .create(&CreateRequest {
            source: dir.path().join("device.img"),
            output: dir.path().join("backup"),
            selections: vec![TransformSelection::compression("gzip")],
            passphrase: None,
            split_size: None,
            verify: true,
            checksums: false,
        })
        .unwrap();

    assert_eq!(outcome.artifact.path, dir.path().join("backup.himg.gz"));
    let decoded = naming::decode("backup.himg.gz").unwrap();
    assert_eq!(decoded.stages, vec![TransformStage::Compression(Compression::Gzip)]);
    assert_eq!(outcome.verification.unwrap().bytes_compared, 4 * 1024 * 1024);
}

#[test]
fn encrypted_split_image_restores_from_its_parts() {
    let dir = tempdir().unwrap();
    let data = write_source(dir.path(), 3 * 1024 * 1024 + 512 * 1024);
    let passphrase = Passphrase::new("split and sealed");

    let mut controller = OperationController::new(ExecutionOptions::default());
    let created = controller
        .create(&CreateRequest {
            source: dir.path().join("device.img"),
            output: dir.path().join("backup"),
            selections: vec![
                TransformSelection::compression("xz"),
                TransformSelection::encryption("aes256"),
            ],
            passphrase: Some(passphrase.clone()),
            split_size: Some("200K".to_string()),
            verify: false,
            checksums: true,
        })
        .unwrap();

    let logical = dir.path().join("backup.himg.aes256.xz");
    assert_eq!(created.artifact.path, logical);
    assert!(created.artifact.parts.len() >= 2);
    assert!(dir.path().join("backup.himg.aes256.xz.part_aa").is_file());
    assert!(dir.path().join("backup.himg.aes256.xz.part_ab").is_file());
    assert!(!logical.exists());

    let destination = dir.path().join("restored.img");
    let restored = controller
        .restore(&RestoreRequest {
            artifact: dir.path().join("backup.himg.aes256.xz.part_ab"),
            destination: destination.clone(),
            declared_stages: None,
            passphrase: Some(passphrase),
            check_checksums: true,
            confirmation: Some(ConfirmationToken::confirm(&destination)),
        })
        .unwrap();
    assert_eq!(restored.artifact.parts, created.artifact.parts);
    assert_eq!(fs::read(&destination).unwrap(), data);
}

#[test]
fn unknown_name_is_unrecognized() {
    assert!(matches!(naming::decode("image.unknown"), Err(Error::UnrecognizedFormat(_))));
}

#[test]
fn restore_without_confirmation_performs_no_writes() {
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("disk.himg");
    fs::write(&artifact, synthetic_image(8192)).unwrap();
    let destination = dir.path().join("target.img");

    let spec = pipeline::build(&PipelineRequest {
        operation: Operation::Restore,
        source: artifact.clone(),
        sink: destination.clone(),
        selections: vec![],
        passphrase: None,
        split_size: None,
        verify: false,
        checksums: false,
    })
    .unwrap();
    let err = executor::execute(&spec, None, &ExecutionOptions::default(), |_| {}, |_| {}).unwrap_err();
    assert!(matches!(err, Error::DestructiveActionNotConfirmed(_)));
    assert!(!destination.exists());

    let mut controller = OperationController::new(ExecutionOptions::default());
    let err = controller
        .restore(&RestoreRequest {
            artifact,
            destination: destination.clone(),
            declared_stages: None,
            passphrase: None,
            check_checksums: false,
            confirmation: None,
        })
        .unwrap_err();
    assert!(matches!(err, Error::DestructiveActionNotConfirmed(_)));
    assert!(!destination.exists());
}

#[test]
fn tampered_sidecar_fails_checksum_check() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), 256 * 1024);

    let mut controller = OperationController::new(ExecutionOptions::default());
    let created = controller
        .create(&CreateRequest {
            source: dir.path().join("device.img"),
            output: dir.path().join("backup"),
            selections: vec![TransformSelection::compression("zstd")],
            passphrase: None,
            split_size: None,
            verify: false,
            checksums: true,
        })
        .unwrap();
    let artifact = ImageArtifact::discover(&created.artifact.path).unwrap();
    assert!(verify::check_checksum(&artifact).unwrap());

    let sidecar = verify::sidecar_path(&artifact.path, verify::SHA256_EXTENSION);
    let mut bytes = fs::read(&sidecar).unwrap();
    bytes[5] = if bytes[5] == b'a' { b'b' } else { b'a' };
    fs::write(&sidecar, bytes).unwrap();
    assert!(!verify::check_checksum(&artifact).unwrap());
}

#[test]
fn failed_create_leaves_no_valid_artifact_or_sidecar() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), 64 * 1024);
    let options = ExecutionOptions::default();
    options.running.store(false, std::sync::atomic::Ordering::SeqCst);

    let mut controller = OperationController::new(options);
    let err = controller
        .create(&CreateRequest {
            source: dir.path().join("device.img"),
            output: dir.path().join("backup"),
            selections: vec![TransformSelection::compression("gzip")],
            passphrase: None,
            split_size: None,
            verify: true,
            checksums: true,
        })
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(!dir.path().join("backup.himg.gz").exists());
    assert!(!dir.path().join("backup.himg.gz.sha256").exists());
    assert!(dir.path().join("backup.himg.gz.incomplete").exists());
    assert!(naming::decode("backup.himg.gz.incomplete").is_err());
}

fn split_create(dir: &Path, split: &str, checksums: bool) -> hardclone_core::controller::CreateOutcome {
    let mut controller = OperationController::new(ExecutionOptions::default());
    controller
        .create(&CreateRequest {
            source: dir.join("device.img"),
            output: dir.join("backup"),
            selections: vec![],
            passphrase: None,
            split_size: Some(split.to_string()),
            verify: true,
            checksums,
        })
        .unwrap()
}

#[test]
fn recreating_with_fewer_parts_drops_the_old_ones() {
    let dir = tempdir().unwrap();
    write_source(dir.path(), 100_000);
    let first = split_create(dir.path(), "16K", true);
    assert_eq!(first.artifact.parts.len(), 7);

    let data = write_source(dir.path(), 40_000);
    let second = split_create(dir.path(), "32K", false);
    assert_eq!(second.artifact.parts.len(), 2);
    assert!(!dir.path().join("backup.himg.part_ac").exists());
    assert!(!dir.path().join("backup.himg.part_aa.sha256").exists());
    assert!(!dir.path().join("backup.himg.part_aa.md5").exists());

    let destination = dir.path().join("restored.img");
    let mut controller = OperationController::new(ExecutionOptions::default());
    let restored = controller
        .restore(&RestoreRequest {
            artifact: dir.path().join("backup.himg.part_aa"),
            destination: destination.clone(),
            declared_stages: None,
            passphrase: None,
            check_checksums: false,
            confirmation: Some(ConfirmationToken::confirm(&destination)),
        })
        .unwrap();
    assert_eq!(restored.artifact.parts, second.artifact.parts);
    assert_eq!(fs::read(&destination).unwrap(), data);
}

#[test]
fn split_create_replaces_an_older_single_file_image() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("backup.himg"), b"stale single-file image").unwrap();
    fs::write(dir.path().join("backup.himg.sha256"), "0  backup.himg\n").unwrap();
    write_source(dir.path(), 20_000);

    let created = split_create(dir.path(), "8K", false);
    assert!(!dir.path().join("backup.himg").exists());
    assert!(!dir.path().join("backup.himg.sha256").exists());
    let found = ImageArtifact::discover(&dir.path().join("backup.himg")).unwrap();
    assert_eq!(found.parts, created.artifact.parts);
}

#[test]
fn empty_source_split_create_is_verifiable() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("device.img"), b"").unwrap();

    let created = split_create(dir.path(), "1K", true);
    assert_eq!(created.artifact.parts, vec![dir.path().join("backup.himg.part_aa")]);
    assert_eq!(created.verification.unwrap().bytes_compared, 0);
    assert!(created.checksums.is_some());

    let found = ImageArtifact::discover(&dir.path().join("backup.himg")).unwrap();
    assert!(verify::check_checksum(&found).unwrap());
}
