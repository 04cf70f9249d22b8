use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `tsumiki`, this serves two purposes:
/// 1. It is the fingerprint of a task's inputs, which keys the artifact cache.
/// 2. It identifies the content of an artifact, which feeds the fingerprints
///    of downstream tasks and ends up in the emitted manifest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap_rayon(path)?.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// Short form used in logs.
    pub fn short(self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    /// Feeds a length-prefixed field, so that adjacent fields can't bleed
    /// into each other ("ab" + "c" vs "a" + "bc").
    pub(crate) fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn finish(&self) -> Hash32 {
        let bytes: [u8; 32] = self.0.finalize().into();
        Hash32::from(bytes)
    }
}

/// The output of a single task.
///
/// An artifact is an opaque byte payload (a compiled class, a jar, the
/// stdout of a command...) together with a set of string attributes the task
/// wants to hand to its dependents or to the manifest emitter. Artifacts are
/// immutable once produced and cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Artifact {
    bytes: Arc<[u8]>,
    attributes: BTreeMap<String, String>,
}

impl Artifact {
    /// An artifact carrying no payload, for tasks run only for their effects.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            bytes: bytes.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self::from_bytes(text.into().into_bytes())
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Content hash covering both the payload and the attributes.
    pub fn hash(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        hasher.field(&self.bytes);
        for (key, value) in &self.attributes {
            hasher.field(key).field(value);
        }
        hasher.finish()
    }
}
