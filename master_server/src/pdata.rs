// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Opaque per-player profile blobs ("pdata") with content-hash
//! fingerprinting. The game's binary profile format is not interpreted here;
//! a [`PdataCodec`] collaborator turns blobs into JSON for the public read
//! endpoints.

use crate::store::StoreError;
use async_trait::async_trait;
use master_protocol::id::PlayerId;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Hard cap on uploaded blobs, enforced again at the HTTP boundary.
pub const MAX_PDATA_LEN: usize = 2 * 1024 * 1024;

/// SHA-256 of the uncompressed blob bytes.
pub type PdataHash = [u8; 32];

pub fn pdata_hash(bytes: &[u8]) -> PdataHash {
    Sha256::digest(bytes).into()
}

/// Shipped with the binary; handed to game servers for players that have
/// never uploaded a profile.
pub fn default_pdata() -> &'static [u8] {
    include_bytes!("default_player.pdata")
}

/// Outcome of a hash-gated read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Cached {
    /// No blob stored for that uid.
    Absent,
    /// The caller's hash matches the stored blob; no bytes returned.
    /// HTTP callers render this as 304 Not Modified.
    Unmodified,
    Blob(Vec<u8>),
}

/// The profile blob storage collaborator. All operations are safe for
/// concurrent calls on distinct or equal uids, and `set` is linearizable per
/// uid against subsequent reads.
#[async_trait]
pub trait PdataStore: Send + Sync {
    /// Fingerprint of the current blob, if any.
    async fn get_hash(&self, uid: PlayerId) -> Result<Option<PdataHash>, StoreError>;

    /// Full blob, unless `client_hash` is present and matches. Returned
    /// buffers never alias buffers passed to a previous `set`.
    async fn get_cached(
        &self,
        uid: PlayerId,
        client_hash: Option<PdataHash>,
    ) -> Result<Cached, StoreError>;

    /// Replaces the blob atomically. Returns the stored size after the
    /// implementation's chosen encoding.
    async fn set(&self, uid: PlayerId, bytes: &[u8]) -> Result<usize, StoreError>;

    /// Unconditional read.
    async fn get(&self, uid: PlayerId) -> Result<Option<Vec<u8>>, StoreError> {
        match self.get_cached(uid, None).await? {
            Cached::Absent => Ok(None),
            Cached::Unmodified => unreachable!("unconditional read cannot be unmodified"),
            Cached::Blob(bytes) => Ok(Some(bytes)),
        }
    }
}

/// In-process store for tests and dev runs.
#[derive(Default)]
pub struct MemoryPdataStore {
    blobs: Mutex<HashMap<PlayerId, (PdataHash, Vec<u8>)>>,
}

impl MemoryPdataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PdataStore for MemoryPdataStore {
    async fn get_hash(&self, uid: PlayerId) -> Result<Option<PdataHash>, StoreError> {
        Ok(self.blobs.lock().unwrap().get(&uid).map(|(hash, _)| *hash))
    }

    async fn get_cached(
        &self,
        uid: PlayerId,
        client_hash: Option<PdataHash>,
    ) -> Result<Cached, StoreError> {
        let blobs = self.blobs.lock().unwrap();
        Ok(match blobs.get(&uid) {
            None => Cached::Absent,
            Some((hash, _)) if client_hash == Some(*hash) => Cached::Unmodified,
            Some((_, bytes)) => Cached::Blob(bytes.clone()),
        })
    }

    async fn set(&self, uid: PlayerId, bytes: &[u8]) -> Result<usize, StoreError> {
        let stored = bytes.to_vec();
        let len = stored.len();
        self.blobs
            .lock()
            .unwrap()
            .insert(uid, (pdata_hash(&stored), stored));
        Ok(len)
    }
}

// On-disk layout: 4-byte tag, 32-byte hash of the uncompressed bytes, then
// the payload (raw or gzip, whichever is smaller).
const TAG_RAW: &[u8; 4] = b"PDR1";
const TAG_GZIP: &[u8; 4] = b"PDZ1";
const HEADER_LEN: usize = 4 + 32;

/// One file per uid under a spool directory. Replacement goes through a
/// temp file and rename so readers never observe a partial write.
pub struct FilePdataStore {
    dir: PathBuf,
}

impl FilePdataStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        // A crash between write and rename can strand temp files; they are
        // garbage by definition.
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "tmp") {
                log::warn!("removing stranded temp file {}", path.display());
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(Self { dir })
    }

    fn path(&self, uid: PlayerId) -> PathBuf {
        self.dir.join(format!("{}.pdata", uid))
    }

    async fn read_header(&self, uid: PlayerId) -> Result<Option<([u8; 4], PdataHash)>, StoreError> {
        let mut file = match tokio::fs::File::open(self.path(uid)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header).await.map_err(|_| StoreError::Corrupt {
            uid,
            detail: "truncated header".to_owned(),
        })?;
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&header[..4]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&header[4..]);
        Ok(Some((tag, hash)))
    }
}

#[async_trait]
impl PdataStore for FilePdataStore {
    async fn get_hash(&self, uid: PlayerId) -> Result<Option<PdataHash>, StoreError> {
        Ok(self.read_header(uid).await?.map(|(_, hash)| hash))
    }

    async fn get_cached(
        &self,
        uid: PlayerId,
        client_hash: Option<PdataHash>,
    ) -> Result<Cached, StoreError> {
        let raw = match tokio::fs::read(self.path(uid)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Cached::Absent),
            Err(e) => return Err(e.into()),
        };
        if raw.len() < HEADER_LEN {
            return Err(StoreError::Corrupt {
                uid,
                detail: "truncated header".to_owned(),
            });
        }
        let (header, payload) = raw.split_at(HEADER_LEN);
        let mut hash: PdataHash = [0u8; 32];
        hash.copy_from_slice(&header[4..]);

        if client_hash == Some(hash) {
            return Ok(Cached::Unmodified);
        }

        let bytes = match &header[..4] {
            tag if tag == TAG_RAW => payload.to_vec(),
            tag if tag == TAG_GZIP => {
                server_util::http::gunzip(payload).map_err(|e| StoreError::Corrupt {
                    uid,
                    detail: format!("gzip payload: {}", e),
                })?
            }
            _ => {
                return Err(StoreError::Corrupt {
                    uid,
                    detail: "unknown encoding tag".to_owned(),
                })
            }
        };

        if pdata_hash(&bytes) != hash {
            return Err(StoreError::Corrupt {
                uid,
                detail: "hash mismatch".to_owned(),
            });
        }
        Ok(Cached::Blob(bytes))
    }

    async fn set(&self, uid: PlayerId, bytes: &[u8]) -> Result<usize, StoreError> {
        let hash = pdata_hash(bytes);
        let gzipped = server_util::http::gzip(bytes);
        let (tag, payload) = if gzipped.len() < bytes.len() {
            (TAG_GZIP, gzipped.as_slice())
        } else {
            (TAG_RAW, bytes)
        };

        let mut file = Vec::with_capacity(HEADER_LEN + payload.len());
        file.extend_from_slice(tag);
        file.extend_from_slice(&hash);
        file.extend_from_slice(payload);

        let path = self.path(uid);
        let tmp = self.dir.join(format!("{}.pdata.tmp", uid));
        tokio::fs::write(&tmp, &file).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(payload.len())
    }
}

#[derive(Debug, Error)]
pub enum PdataDecodeError {
    #[error("pdata is not decodable: {0}")]
    Malformed(String),
}

/// Decodes an opaque blob into a JSON object for the read endpoints. The
/// game-specific binary codec plugs in here.
pub trait PdataCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Map<String, Value>, PdataDecodeError>;
}

/// Treats the blob as a JSON document. Matches the default blob shipped in
/// this binary and the format our own tools write.
pub struct JsonPdataCodec;

impl PdataCodec for JsonPdataCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Map<String, Value>, PdataDecodeError> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(PdataDecodeError::Malformed("not an object".to_owned())),
            Err(e) => Err(PdataDecodeError::Malformed(e.to_string())),
        }
    }
}

/// Keeps only the whitelisted top-level fields, in whitelist order.
pub fn project_fields(map: &Map<String, Value>, whitelist: &[&str]) -> Map<String, Value> {
    let mut out = Map::new();
    for &field in whitelist {
        if let Some(value) = map.get(field) {
            out.insert(field.to_owned(), value.clone());
        }
    }
    out
}
