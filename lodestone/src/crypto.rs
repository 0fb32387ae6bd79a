use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Streaming cipher context for one direction of a connection.
///
/// The transform is a pure keystream XOR, so the output always has the same
/// length as the input and arbitrary segmentations of a byte stream produce
/// the same result. Encryption and decryption are the same operation; the
/// two directions of a connection simply own separate contexts keyed with
/// their own IV.
pub struct StreamCtx {
    inner: Aes256Ctr,
}

impl StreamCtx {
    #[inline]
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> StreamCtx {
        StreamCtx {
            inner: Aes256Ctr::new(key.into(), iv.into()),
        }
    }

    /// Transforms `data` in place, advancing the keystream position.
    #[inline]
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

/// Generates a fresh random IV for the sending direction of a connection.
#[inline]
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = [33; KEY_SIZE];
    const IV: [u8; IV_SIZE] = [7; IV_SIZE];

    #[test]
    fn test_roundtrip() {
        let plain: Vec<u8> = (0..4096).map(|i| i as u8).collect();

        let mut data = plain.clone();
        StreamCtx::new(&KEY, &IV).apply(&mut data);

        assert_ne!(data, plain);

        StreamCtx::new(&KEY, &IV).apply(&mut data);

        assert_eq!(data, plain);
    }

    #[test]
    fn test_segmentation_invariance() {
        let plain: Vec<u8> = (0..1000).map(|i| (i * 31) as u8).collect();

        // Encrypt in irregular chunks, decrypt in different irregular chunks.
        let mut encrypt = StreamCtx::new(&KEY, &IV);
        let mut cipher = plain.clone();
        let mut cursor = 0;
        for chunk in &[1usize, 7, 64, 128, 300, 500] {
            let end = (cursor + chunk).min(cipher.len());
            encrypt.apply(&mut cipher[cursor..end]);
            cursor = end;
        }
        assert_eq!(cursor, cipher.len());

        let mut decrypt = StreamCtx::new(&KEY, &IV);
        let mut output = cipher;
        let mut cursor = 0;
        for chunk in &[13usize, 2, 985] {
            let end = (cursor + chunk).min(output.len());
            decrypt.apply(&mut output[cursor..end]);
            cursor = end;
        }

        assert_eq!(output, plain);
    }

    #[test]
    fn test_distinct_ivs_diverge() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];

        StreamCtx::new(&KEY, &IV).apply(&mut a);
        StreamCtx::new(&KEY, &[8; IV_SIZE]).apply(&mut b);

        assert_ne!(&a[..], &b[..]);
    }

    #[test]
    fn test_random_iv_is_random() {
        assert_ne!(random_iv(), random_iv());
    }
}
