// Copyright (c) 2018-2021 The MobileCoin Foundation

//! Path encryption: AES-256-GCM per bucket with a fresh nonce every write.
//!
//! Each bucket is independently sealed as `nonce || ciphertext || tag`, so a
//! bucket on the wire is indistinguishable from fresh randomness and every
//! write-back re-randomizes the whole path. A failed decryption means the
//! server tampered with (or lost) data and is fatal.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use oram_types::{Bucket, Path};
use rand::{CryptoRng, Rng, RngCore};

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Seals and opens paths under the proxy's secret key.
pub struct PathCipher {
    cipher: Aes256Gcm,
    height: u32,
    bucket_size: usize,
    block_size: usize,
}

impl PathCipher {
    /// A cipher for paths over a tree of `height`, with `bucket_size` slot
    /// buckets of `block_size` byte blocks.
    pub fn new(key: &[u8; 32], height: u32, bucket_size: usize, block_size: usize) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            height,
            bucket_size,
            block_size,
        }
    }

    /// Wire length of one sealed bucket.
    pub fn encrypted_bucket_len(&self) -> usize {
        NONCE_LEN + Bucket::plaintext_len(self.bucket_size, self.block_size) + TAG_LEN
    }

    /// Wire length of one sealed path.
    pub fn encrypted_path_len(&self) -> usize {
        (self.height as usize + 1) * self.encrypted_bucket_len()
    }

    /// Seal one bucket under a fresh nonce.
    pub fn encrypt_bucket<R: RngCore + CryptoRng>(
        &self,
        bucket: &Bucket,
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let nonce: [u8; NONCE_LEN] = rng.gen();
        let plaintext = bucket.to_plaintext(self.block_size);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let mut out = Vec::with_capacity(self.encrypted_bucket_len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open one sealed bucket. Authentication failure is fatal.
    pub fn decrypt_bucket(&self, bytes: &[u8]) -> Result<Bucket> {
        if bytes.len() != self.encrypted_bucket_len() {
            return Err(Error::PathAuthentication);
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::PathAuthentication)?;
        Bucket::from_plaintext(&plaintext, self.block_size).map_err(|_| Error::PathAuthentication)
    }

    /// Seal every bucket of a path, root first.
    pub fn encrypt_path<R: RngCore + CryptoRng>(
        &self,
        path: &Path,
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encrypted_path_len());
        for bucket in path.buckets() {
            out.extend_from_slice(&self.encrypt_bucket(bucket, rng)?);
        }
        Ok(out)
    }

    /// Open a sealed path and stamp it with its absolute leaf id.
    pub fn decrypt_path(&self, leaf: u64, bytes: &[u8]) -> Result<Path> {
        if bytes.len() != self.encrypted_path_len() {
            return Err(Error::PathAuthentication);
        }
        let buckets = bytes
            .chunks_exact(self.encrypted_bucket_len())
            .map(|chunk| self.decrypt_bucket(chunk))
            .collect::<Result<Vec<_>>>()?;
        Ok(Path::new(leaf, buckets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oram_types::Block;
    use rand::{rngs::StdRng, SeedableRng};

    fn cipher() -> PathCipher {
        PathCipher::new(&[7u8; 32], 3, 4, 4)
    }

    #[test]
    fn path_round_trip_is_bitwise() {
        let cipher = cipher();
        let mut rng: StdRng = SeedableRng::from_seed([1u8; 32]);

        let mut path = Path::empty(5, 3, 4);
        path.buckets_mut()[2].try_add(Block::new(17, vec![0xCA, 0xFE, 0xBA, 0xBE]), 9);

        let sealed = cipher.encrypt_path(&path, &mut rng).unwrap();
        assert_eq!(sealed.len(), cipher.encrypted_path_len());
        assert_eq!(cipher.decrypt_path(5, &sealed).unwrap(), path);
    }

    #[test]
    fn reencryption_randomizes_the_wire() {
        let cipher = cipher();
        let mut rng: StdRng = SeedableRng::from_seed([2u8; 32]);

        let path = Path::empty(0, 3, 4);
        let first = cipher.encrypt_path(&path, &mut rng).unwrap();
        let second = cipher.encrypt_path(&path, &mut rng).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampering_is_detected() {
        let cipher = cipher();
        let mut rng: StdRng = SeedableRng::from_seed([3u8; 32]);

        let mut sealed = cipher
            .encrypt_path(&Path::empty(0, 3, 4), &mut rng)
            .unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;

        match cipher.decrypt_path(0, &sealed) {
            Err(Error::PathAuthentication) => {}
            other => panic!("expected PathAuthentication, got {:?}", other),
        }
    }

    #[test]
    fn wrong_length_is_rejected() {
        let cipher = cipher();
        match cipher.decrypt_path(0, &[0u8; 10]) {
            Err(Error::PathAuthentication) => {}
            other => panic!("expected PathAuthentication, got {:?}", other),
        }
    }
}
