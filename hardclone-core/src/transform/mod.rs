//! In-process implementations of the transform stages.
mod compress;
mod crypto;

use std::io::{self, Read, Write};

use crate::stage::{Direction, Passphrase, PlannedStage, TransformStage};

/// Runs one stage over a stream, from `input` to `output`, until EOF.
pub(crate) fn run_native(
    planned: &PlannedStage,
    passphrase: Option<&Passphrase>,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> io::Result<()> {
    let result = match (planned.stage, planned.direction) {
        (TransformStage::Compression(c), Direction::Forward) => compress::compress(c, input, output),
        (TransformStage::Compression(c), Direction::Inverse) => compress::decompress(c, input, output),
        (TransformStage::Encryption(e), direction) => {
            let passphrase = passphrase.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "cipher stage requires a passphrase")
            })?;
            match direction {
                Direction::Forward => crypto::encrypt(e, passphrase, input, output),
                Direction::Inverse => crypto::decrypt(e, passphrase, input, output),
            }
        }
    };
    result?;
    output.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Compression, Encryption};
    use proptest::prelude::*;

    fn all_stages() -> Vec<TransformStage> {
        Compression::ALL
            .into_iter()
            .map(TransformStage::Compression)
            .chain(Encryption::ALL.into_iter().map(TransformStage::Encryption))
            .collect()
    }

    fn apply(stage: TransformStage, direction: Direction, pass: &Passphrase, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        run_native(&PlannedStage { stage, direction }, Some(pass), &mut &data[..], &mut out).unwrap();
        out
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn every_stage_inverts_its_forward_transform(data in proptest::collection::vec(any::<u8>(), 0..20_000)) {
            let pass = Passphrase::new("prop");
            for stage in all_stages() {
                let forward = apply(stage, Direction::Forward, &pass, &data);
                let back = apply(stage, Direction::Inverse, &pass, &forward);
                prop_assert_eq!(&back, &data, "stage {}", stage);
            }
        }
    }

    #[test]
    fn cipher_without_passphrase_is_rejected() {
        let planned = PlannedStage {
            stage: TransformStage::Encryption(Encryption::ChaCha20),
            direction: Direction::Forward,
        };
        let mut out = Vec::new();
        let err = run_native(&planned, None, &mut io::empty(), &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
