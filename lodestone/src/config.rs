use serde::{de, Deserialize as _, Deserializer, Serializer};
use serde_derive::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::path::Path;

use crate::crypto::KEY_SIZE;

pub const DEFAULT_PORT: u16 = 1080;

/// The symmetric cipher key shared by the local and server proxies,
/// stored in the config file as base64. Key derivation from a passphrase
/// is left to the operator's tooling.
#[derive(Serialize, Deserialize, Clone)]
pub struct PresharedKey(
    #[serde(
        serialize_with = "serialize_b64_key",
        deserialize_with = "deserialize_b64_key"
    )]
    [u8; KEY_SIZE],
);

#[inline]
fn serialize_b64_key<S>(key: &[u8; KEY_SIZE], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&base64::encode(&key[..]))
}

#[inline]
fn deserialize_b64_key<'de, D>(deserializer: D) -> Result<[u8; KEY_SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let decoded_raw = base64::decode(&s).map_err(de::Error::custom)?;

    if decoded_raw.len() != KEY_SIZE {
        return Err(de::Error::custom(format!(
            "preshared key must decode to exactly {} bytes, got {}",
            KEY_SIZE,
            decoded_raw.len()
        )));
    }

    let mut decoded = [0u8; KEY_SIZE];
    decoded.copy_from_slice(&decoded_raw);

    Ok(decoded)
}

impl PresharedKey {
    pub const SIZE: usize = KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> PresharedKey {
        PresharedKey(key)
    }
}

impl Deref for PresharedKey {
    type Target = [u8; PresharedKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; PresharedKey::SIZE] {
        &self.0
    }
}

impl DerefMut for PresharedKey {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8; PresharedKey::SIZE] {
        &mut self.0
    }
}

/// Runtime configuration shared by both relay roles. The `peer` address is
/// only meaningful for the local role, where it names the server proxy that
/// encrypted connections are relayed to.
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: String,
    pub peer: Option<String>,
    pub key: PresharedKey,
    pub max_links: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> RelayConfig {
        RelayConfig {
            listen: format!("127.0.0.1:{}", DEFAULT_PORT),
            peer: None,
            key: PresharedKey::new([0; KEY_SIZE]),
            max_links: 256,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
        }
    }
}

impl RelayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> RelayConfig {
        serdeconv::from_toml_file(path).expect("Error loading relay configuration file")
    }
}
