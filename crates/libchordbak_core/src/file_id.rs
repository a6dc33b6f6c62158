use std::path::Path;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use sha2::{Digest, Sha256};

/// Content-and-metadata derived identifier of a backed up file.
///
/// Hashes the file name together with size, creation and modification
/// times and the owning path, so editing a file yields a new id while the
/// sent-files entry keeps tracking it under its filename.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub [u8; 32]);

impl FileId {
    /// Derive the id of a local file from its filesystem metadata.
    /// Returns the id and the file size in bytes.
    pub fn of_path(path: &Path) -> anyhow::Result<(FileId, u64)> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("error reading metadata of {path:?}"))?;
        if !meta.is_file() {
            anyhow::bail!("{path:?} is not a regular file");
        }
        let mut hasher = Sha256::new();
        if let Some(name) = path.file_name() {
            hasher.update(name.to_string_lossy().as_bytes());
        }
        hasher.update(meta.len().to_be_bytes());
        for ts in [meta.created().ok(), meta.modified().ok()] {
            let secs = ts
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            hasher.update(secs.to_be_bytes());
        }
        hasher.update(path.to_string_lossy().as_bytes());
        Ok((FileId(hasher.finalize().into()), meta.len()))
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl std::fmt::Debug for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough to tell files apart in logs.
        write!(f, "{}", &self.as_string()[..12])
    }
}

impl FromStr for FileId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        if s.len() != 64 {
            anyhow::bail!("expected a hex string of length 64, got {}", s.len());
        }
        hex::decode_to_slice(s, &mut out).context("invalid hex in file id")?;
        Ok(FileId(out))
    }
}

impl serde::Serialize for FileId {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.as_string())
    }
}

impl<'de> serde::Deserialize<'de> for FileId {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl serde::de::Visitor<'_> for Visitor {
            type Value = FileId;
            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a 64-character hex string")
            }
            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }
        de.deserialize_str(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hex_roundtrip() {
        let id = FileId([0xab; 32]);
        let parsed: FileId = id.as_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("deadbeef".parse::<FileId>().is_err());
    }

    #[test]
    fn serde_as_hex_string() {
        let id = FileId([7; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_string()));
        let back: FileId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn derivation_is_stable_per_file() {
        let dir = std::env::temp_dir().join(format!("chordbak-fileid-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello").unwrap();
        drop(f);

        let (id1, size) = FileId::of_path(&path).unwrap();
        let (id2, _) = FileId::of_path(&path).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(size, 5);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
