//! On-store layout of a backup.
//!
//! A backup is a prefix holding `manifest.json` and one object per chunk.
//! Each chunk is the JSON array of its emails, optionally gzipped and then
//! optionally sealed. The manifest records every chunk's SHA-256 over the
//! stored bytes, so corruption is caught before anything is decrypted.

use std::io::{Read, Write};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::domain::{
    BackupId, BackupMetadata, BackupType, Email, UserId, SUPPORTED_BACKUP_VERSIONS,
};
use crate::error::{EngineError, Result};
use crate::storage::crypto::{generate_salt, sha256_hex};
use crate::storage::Cipher;

pub const MANIFEST_NAME: &str = "manifest.json";

/// One stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEntry {
    pub index: u32,
    pub path: String,
    /// Hex SHA-256 of the stored bytes.
    pub checksum: String,
    pub email_count: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub backup_id: BackupId,
    pub user_id: UserId,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    pub email_count: u64,
    pub compressed: bool,
    pub encrypted: bool,
    /// Base64 PBKDF2 salt, present when encrypted.
    #[serde(default)]
    pub salt: Option<String>,
    pub chunks: Vec<ChunkEntry>,
    pub metadata: BackupMetadata,
}

impl Manifest {
    pub fn size_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size_bytes).sum()
    }
}

pub fn chunk_path(prefix: &str, index: u32) -> String {
    format!("{prefix}/chunk-{index:05}.bin")
}

pub fn manifest_path(prefix: &str) -> String {
    format!("{prefix}/{MANIFEST_NAME}")
}

/// Parses a manifest and checks its format version.
pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    let manifest: Manifest = serde_json::from_slice(bytes)
        .map_err(|e| EngineError::InvalidBackupFormat(format!("unreadable manifest: {e}")))?;
    if !SUPPORTED_BACKUP_VERSIONS.contains(&manifest.version.as_str()) {
        return Err(EngineError::InvalidBackupFormat(format!(
            "unsupported backup version {}",
            manifest.version
        )));
    }
    if manifest.encrypted && manifest.salt.is_none() {
        return Err(EngineError::InvalidBackupFormat(
            "encrypted backup without salt".into(),
        ));
    }
    Ok(manifest)
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Encodes and decodes the chunks of one backup.
pub struct ChunkCodec {
    compress: bool,
    cipher: Option<Cipher>,
    /// Binds sealed chunks to their owner and backup.
    context: String,
}

impl ChunkCodec {
    /// Codec for writing. Encryption derives a key from `password` under a
    /// fresh salt, returned base64-encoded for the manifest.
    pub fn for_writing(
        user_id: &UserId,
        backup_id: &BackupId,
        compress: bool,
        password: Option<&str>,
    ) -> Result<(Self, Option<String>)> {
        let (cipher, salt) = match password {
            Some(password) => {
                let salt = generate_salt()?;
                let cipher = Cipher::derive(password, &salt)?;
                (
                    Some(cipher),
                    Some(base64::engine::general_purpose::STANDARD.encode(salt)),
                )
            }
            None => (None, None),
        };
        Ok((
            Self {
                compress,
                cipher,
                context: format!("{user_id}:{backup_id}"),
            },
            salt,
        ))
    }

    /// Codec for reading the chunks `manifest` describes.
    pub fn for_reading(manifest: &Manifest, password: Option<&str>) -> Result<Self> {
        let cipher = if manifest.encrypted {
            let password = password
                .filter(|p| !p.is_empty())
                .ok_or_else(|| EngineError::EncryptionFailed("a password is required".into()))?;
            let salt = manifest
                .salt
                .as_deref()
                .and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
                .ok_or_else(|| EngineError::InvalidBackupFormat("invalid salt".into()))?;
            Some(Cipher::derive(password, &salt)?)
        } else {
            None
        };
        Ok(Self {
            compress: manifest.compressed,
            cipher,
            context: format!("{}:{}", manifest.user_id, manifest.backup_id),
        })
    }

    fn aad(&self, index: u32) -> Vec<u8> {
        format!("{}:{}", self.context, index).into_bytes()
    }

    pub fn encode(&self, index: u32, emails: &[Email]) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(emails)?;
        if self.compress {
            bytes = gzip(&bytes).map_err(|e| EngineError::Internal(format!("gzip failed: {e}")))?;
        }
        if let Some(cipher) = &self.cipher {
            bytes = cipher.seal(&bytes, &self.aad(index))?;
        }
        Ok(bytes)
    }

    /// Verifies and decodes one chunk.
    pub fn decode(&self, entry: &ChunkEntry, stored: &[u8]) -> Result<Vec<Email>> {
        let invalid = |what: &str| {
            EngineError::BackupValidationFailed(format!("chunk {} {}", entry.index, what))
        };

        if sha256_hex(stored) != entry.checksum {
            return Err(invalid("failed its checksum"));
        }
        let mut bytes = match &self.cipher {
            Some(cipher) => cipher
                .open(stored, &self.aad(entry.index))
                .map_err(|_| invalid("could not be decrypted"))?,
            None => stored.to_vec(),
        };
        if self.compress {
            bytes = gunzip(&bytes).map_err(|_| invalid("could not be decompressed"))?;
        }
        let emails: Vec<Email> =
            serde_json::from_slice(&bytes).map_err(|e| invalid(&format!("is malformed: {e}")))?;

        if emails.len() as u64 != entry.email_count {
            return Err(invalid("has the wrong email count"));
        }
        if let Some(bad) = emails
            .iter()
            .find(|e| e.id.as_str().is_empty() || e.folder_id.as_str().is_empty())
        {
            return Err(invalid(&format!(
                "has a record missing required fields ({})",
                bad.id
            )));
        }
        Ok(emails)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, BackupScope, BACKUP_FORMAT_VERSION};
    use serde_json::json;

    fn email(id: &str) -> Email {
        serde_json::from_value(json!({
            "id": id,
            "user_id": "user-1",
            "provider_id": null,
            "provider_message_id": null,
            "thread_id": null,
            "subject": "Hello",
            "sender": Address::new("a@example.com"),
            "recipients": { "to": [] },
            "content": { "text": "hi", "html": null },
            "attachments": [],
            "labels": [],
            "folder_id": "inbox",
            "is_read": false,
            "is_starred": false,
            "is_important": false,
            "direction": "inbound",
            "received_at": "2024-01-01T00:00:00Z",
            "sent_at": null,
            "client_id": null,
            "related_documents": [],
            "deleted_at": null,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    fn entry(index: u32, stored: &[u8], count: u64) -> ChunkEntry {
        ChunkEntry {
            index,
            path: chunk_path("backups/u/b", index),
            checksum: sha256_hex(stored),
            email_count: count,
            size_bytes: stored.len() as u64,
        }
    }

    fn manifest(encrypted: bool, salt: Option<String>) -> Manifest {
        Manifest {
            version: BACKUP_FORMAT_VERSION.into(),
            backup_id: BackupId::from("b"),
            user_id: UserId::from("user-1"),
            backup_type: BackupType::Full,
            created_at: Utc::now(),
            email_count: 1,
            compressed: true,
            encrypted,
            salt,
            chunks: vec![],
            metadata: BackupMetadata {
                version: BACKUP_FORMAT_VERSION.into(),
                scope: BackupScope::Full,
                folders: vec![],
                batch_size: 1000,
                include_deleted: false,
            },
        }
    }

    #[test]
    fn encrypted_chunks_need_the_password() {
        let user = UserId::from("user-1");
        let id = BackupId::from("b");
        let (writer, salt) = ChunkCodec::for_writing(&user, &id, true, Some("hunter2")).unwrap();
        let stored = writer.encode(0, &[email("e1")]).unwrap();
        let entry = entry(0, &stored, 1);
        let manifest = manifest(true, salt);

        let reader = ChunkCodec::for_reading(&manifest, Some("hunter2")).unwrap();
        assert_eq!(reader.decode(&entry, &stored).unwrap()[0].id.as_str(), "e1");

        let wrong = ChunkCodec::for_reading(&manifest, Some("wrong")).unwrap();
        assert!(matches!(
            wrong.decode(&entry, &stored),
            Err(EngineError::BackupValidationFailed(_))
        ));
        assert!(matches!(
            ChunkCodec::for_reading(&manifest, None),
            Err(EngineError::EncryptionFailed(_))
        ));
    }

    #[test]
    fn tampered_chunk_fails_checksum() {
        let (codec, _) = ChunkCodec::for_writing(
            &UserId::from("user-1"),
            &BackupId::from("b"),
            false,
            None,
        )
        .unwrap();
        let mut stored = codec.encode(0, &[email("e1")]).unwrap();
        let entry = entry(0, &stored, 1);
        stored[0] ^= 0xff;

        let err = codec.decode(&entry, &stored).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let (codec, _) = ChunkCodec::for_writing(
            &UserId::from("user-1"),
            &BackupId::from("b"),
            true,
            None,
        )
        .unwrap();
        let stored = codec.encode(0, &[email("e1"), email("e2")]).unwrap();
        let entry = entry(0, &stored, 3);
        assert!(matches!(
            codec.decode(&entry, &stored),
            Err(EngineError::BackupValidationFailed(_))
        ));
    }

    #[test]
    fn unsupported_version_is_an_invalid_format() {
        let mut m = manifest(false, None);
        m.version = "9.9".into();
        let bytes = serde_json::to_vec(&m).unwrap();
        assert!(matches!(
            parse_manifest(&bytes),
            Err(EngineError::InvalidBackupFormat(_))
        ));
        assert!(matches!(
            parse_manifest(b"not json"),
            Err(EngineError::InvalidBackupFormat(_))
        ));
    }
}
