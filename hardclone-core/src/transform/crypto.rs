//! Passphrase-keyed stream encryption in the `openssl enc -pbkdf2` container.
//!
//! Layout: `"Salted__" | salt (8 B) | ciphertext`. Key and IV come from
//! PBKDF2-HMAC-SHA256 over the passphrase and salt (10 000 rounds, 48 bytes:
//! 32 key bytes followed by 16 IV bytes), which is what
//! `openssl enc -<cipher> -salt -pbkdf2` produces, so artifacts written by the
//! native and external backends are interchangeable.
//!
//! - AES-256-CBC uses PKCS#7 padding.
//! - ChaCha20 takes the 16-byte IV as OpenSSL does: a little-endian 32-bit
//!   block counter followed by the 96-bit nonce. When the counter wraps, the
//!   carry goes into the first nonce word.
use aes::Aes256;
use chacha20::ChaChaCore;
use chacha20::cipher::consts::U10;
use chacha20::cipher::generic_array::GenericArray;
use chacha20::cipher::{
    BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipherCore, StreamCipherSeekCore,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::io::{self, Read, Write};

use crate::stage::{Encryption, Passphrase};

const MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const PBKDF2_ROUNDS: u32 = 10_000;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const AES_BLOCK: usize = 16;
const CHACHA_BLOCK: usize = 64;
const CHUNK: usize = 64 * 1024;

type AesCbcEnc = cbc::Encryptor<Aes256>;
type AesCbcDec = cbc::Decryptor<Aes256>;
type ChaCha20Core = ChaChaCore<U10>;

pub(crate) fn encrypt(
    algorithm: Encryption,
    passphrase: &Passphrase,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> io::Result<()> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    output.write_all(MAGIC)?;
    output.write_all(&salt)?;

    let (key, iv) = derive_key_iv(passphrase, &salt);
    match algorithm {
        Encryption::Aes256Cbc => cbc_encrypt(&key, &iv, input, output),
        Encryption::ChaCha20 => chacha_apply(&key, &iv, input, output),
    }
}

pub(crate) fn decrypt(
    algorithm: Encryption,
    passphrase: &Passphrase,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> io::Result<()> {
    let mut header = [0u8; MAGIC.len() + SALT_LEN];
    input.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => bad_data("stream is too short to carry a salt header"),
        _ => e,
    })?;
    if &header[..MAGIC.len()] != MAGIC {
        return Err(bad_data("missing 'Salted__' header; not an encrypted stream"));
    }

    let (key, iv) = derive_key_iv(passphrase, &header[MAGIC.len()..]);
    match algorithm {
        Encryption::Aes256Cbc => cbc_decrypt(&key, &iv, input, output),
        Encryption::ChaCha20 => chacha_apply(&key, &iv, input, output),
    }
}

fn derive_key_iv(passphrase: &Passphrase, salt: &[u8]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut material = [0u8; KEY_LEN + IV_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.expose().as_bytes(), salt, PBKDF2_ROUNDS, &mut material);
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&material[..KEY_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..]);
    (key, iv)
}

fn bad_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn key_error(_: chacha20::cipher::InvalidLength) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "invalid key or IV length")
}

/// `read` that retries on `Interrupted`.
fn read_some(input: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match input.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => return r,
        }
    }
}

fn cbc_encrypt(key: &[u8], iv: &[u8], input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
    let mut enc = AesCbcEnc::new_from_slices(key, iv).map_err(key_error)?;
    let mut buf = vec![0u8; CHUNK];
    let mut filled = 0;

    loop {
        let n = read_some(input, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        let whole = filled - filled % AES_BLOCK;
        for block in buf[..whole].chunks_exact_mut(AES_BLOCK) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output.write_all(&buf[..whole])?;
        buf.copy_within(whole..filled, 0);
        filled -= whole;
    }

    // PKCS#7: a full block of padding when the input is block aligned.
    let pad = AES_BLOCK - filled;
    buf[filled..AES_BLOCK].fill(pad as u8);
    enc.encrypt_block_mut(GenericArray::from_mut_slice(&mut buf[..AES_BLOCK]));
    output.write_all(&buf[..AES_BLOCK])?;
    Ok(())
}

fn cbc_decrypt(key: &[u8], iv: &[u8], input: &mut dyn Read, output: &mut dyn Write) -> io::Result<()> {
    let mut dec = AesCbcDec::new_from_slices(key, iv).map_err(key_error)?;
    let mut buf = vec![0u8; CHUNK];
    let mut filled = 0;

    loop {
        let n = read_some(input, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        // The last complete block is held back until EOF; it carries the padding.
        let whole = filled - filled % AES_BLOCK;
        let ready = whole.saturating_sub(AES_BLOCK);
        for block in buf[..ready].chunks_exact_mut(AES_BLOCK) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output.write_all(&buf[..ready])?;
        buf.copy_within(ready..filled, 0);
        filled -= ready;
    }

    if filled != AES_BLOCK {
        return Err(bad_data("ciphertext length is not a multiple of the cipher block size"));
    }
    dec.decrypt_block_mut(GenericArray::from_mut_slice(&mut buf[..AES_BLOCK]));
    let pad = buf[AES_BLOCK - 1] as usize;
    let valid = (1..=AES_BLOCK).contains(&pad)
        && buf[AES_BLOCK - pad..AES_BLOCK].iter().all(|&b| b as usize == pad);
    if !valid {
        return Err(bad_data("bad decrypt: wrong passphrase or corrupted data"));
    }
    output.write_all(&buf[..AES_BLOCK - pad])?;
    Ok(())
}

/// ChaCha20 keystream with OpenSSL's counter/nonce layout.
struct ChaChaStream {
    key: [u8; KEY_LEN],
    nonce: [u8; 12],
    counter: u32,
    core: ChaCha20Core,
    block: [u8; CHACHA_BLOCK],
    used: usize,
}

impl ChaChaStream {
    fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> io::Result<Self> {
        let counter = u32::from_le_bytes([iv[0], iv[1], iv[2], iv[3]]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&iv[4..]);
        let mut core = ChaCha20Core::new_from_slices(key, &nonce).map_err(key_error)?;
        core.set_block_pos(counter);
        Ok(Self {
            key: *key,
            nonce,
            counter,
            core,
            block: [0u8; CHACHA_BLOCK],
            used: CHACHA_BLOCK,
        })
    }

    fn refill(&mut self) -> io::Result<()> {
        let mut ks = GenericArray::default();
        self.core.write_keystream_block(&mut ks);
        self.block.copy_from_slice(&ks);
        self.used = 0;

        self.counter = self.counter.wrapping_add(1);
        if self.counter == 0 {
            let word = u32::from_le_bytes([self.nonce[0], self.nonce[1], self.nonce[2], self.nonce[3]]);
            self.nonce[..4].copy_from_slice(&word.wrapping_add(1).to_le_bytes());
            self.core = ChaCha20Core::new_from_slices(&self.key, &self.nonce).map_err(key_error)?;
        }
        Ok(())
    }

    fn apply(&mut self, data: &mut [u8]) -> io::Result<()> {
        for byte in data {
            if self.used == CHACHA_BLOCK {
                self.refill()?;
            }
            *byte ^= self.block[self.used];
            self.used += 1;
        }
        Ok(())
    }
}

fn chacha_apply(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> io::Result<()> {
    let mut stream = ChaChaStream::new(key, iv)?;
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = read_some(input, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        stream.apply(&mut buf[..n])?;
        output.write_all(&buf[..n])?;
    }
}
