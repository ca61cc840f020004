// BLAKE3 content ids for stored objects
use crate::error::{DatasetError, IoContext, Result};
use blake3::{Hash, Hasher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

/// Content id of an object in the store
///
/// Rendered as 64 lowercase hex characters, which is also the object's
/// file name under `objects/`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(Hash);

impl ObjectId {
    /// Hash a file using streaming I/O
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;

        let reader = BufReader::with_capacity(1024 * 1024, file);
        Self::from_reader(reader).map_err(|e| match e {
            DatasetError::Io { source, .. } => DatasetError::Io {
                context: format!("Failed to hash file: {}", path.display()),
                source,
            },
            other => other,
        })
    }

    /// Hash a file on the blocking pool
    pub async fn from_file_async(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::from_file(path)).await?
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = ObjectHasher::new();
        let mut buffer = [0u8; 16384];

        loop {
            let bytes_read = reader
                .read(&mut buffer)
                .with_context(|| "Failed to read data for hashing".to_string())?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize())
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        ObjectId(blake3::hash(data))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// Incremental hasher used while objects are copied
pub struct ObjectHasher(Hasher);

impl ObjectHasher {
    pub fn new() -> Self {
        ObjectHasher(Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(&self) -> ObjectId {
        ObjectId(self.0.finalize())
    }
}

impl Default for ObjectHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ObjectId({})", &hex[..12])
    }
}

impl FromStr for ObjectId {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(DatasetError::InvalidArgument(format!(
                "Invalid object id length: expected 64 hex chars, got {}",
                s.len()
            )));
        }

        let bytes = hex::decode(s)
            .map_err(|e| DatasetError::InvalidArgument(format!("Invalid object id {}: {}", s, e)))?;

        let mut hash_bytes = [0u8; 32];
        hash_bytes.copy_from_slice(&bytes);

        Ok(ObjectId(Hash::from(hash_bytes)))
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_str(&s).map_err(serde::de::Error::custom)
    }
}
