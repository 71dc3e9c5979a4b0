//! Forgettable payload store
//!
//! Event payloads never enter the event store; they live here behind the
//! pseudonym carried in `payload_ref`, encrypted per session with AES-GCM.
//! Keys sit in a separate key directory (standing in for an external KMS).
//! Erasure is crypto-shredding: delete the key first, then the blobs.

use std::path::PathBuf;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

/// Payload store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Payload store unavailable: {0}")]
    Unavailable(String),
}

/// Payload store result type
pub type Result<T> = std::result::Result<T, PayloadError>;

/// Key→encrypted-blob store keyed by pseudonym
pub struct PayloadStore {
    conn: Mutex<Connection>,
    key_dir: PathBuf,
}

impl PayloadStore {
    /// Open (or create) the store and its key directory
    pub fn open(db_path: PathBuf, key_dir: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(&key_dir)?;

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS payloads (
                pseudonym TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                nonce BLOB NOT NULL,
                ciphertext BLOB NOT NULL,
                created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_payloads_session ON payloads(session_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            key_dir,
        })
    }

    fn key_path(&self, session_id: &str) -> PathBuf {
        let digest = Sha256::digest(session_id.as_bytes());
        let mut hex = String::with_capacity(32);
        for byte in digest.iter().take(16) {
            hex.push_str(&format!("{:02x}", byte));
        }
        self.key_dir.join(format!("{hex}.key"))
    }

    /// Load the session key, creating it on first use. Returns `None` when
    /// the key was shredded (payloads are unrecoverable by design).
    fn session_key(&self, session_id: &str, create: bool) -> Result<Option<[u8; 32]>> {
        let path = self.key_path(session_id);
        if path.exists() {
            let raw = std::fs::read(&path)?;
            let key: [u8; 32] = raw
                .try_into()
                .map_err(|_| PayloadError::Crypto("malformed key file".to_string()))?;
            return Ok(Some(key));
        }
        if !create {
            return Ok(None);
        }
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        std::fs::write(&path, key)?;
        Ok(Some(key))
    }

    /// Store a payload under its pseudonym; idempotent (first write wins)
    pub fn put(&self, pseudonym: &str, session_id: &str, plaintext: &str) -> Result<()> {
        let key = self
            .session_key(session_id, true)?
            .ok_or_else(|| PayloadError::Crypto("session key unavailable".to_string()))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| PayloadError::Crypto(e.to_string()))?;

        let conn = self
            .conn
            .lock()
            .map_err(|_| PayloadError::Unavailable("lock poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO payloads (pseudonym, session_id, nonce, ciphertext, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(pseudonym) DO NOTHING",
            params![pseudonym, session_id, nonce.as_slice(), ciphertext, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Resolve a pseudonym to its plaintext; `None` when absent or shredded
    pub fn get(&self, pseudonym: &str) -> Result<Option<String>> {
        let row: Option<(String, Vec<u8>, Vec<u8>)> = {
            let conn = self
                .conn
                .lock()
                .map_err(|_| PayloadError::Unavailable("lock poisoned".to_string()))?;
            conn.query_row(
                "SELECT session_id, nonce, ciphertext FROM payloads WHERE pseudonym = ?1",
                params![pseudonym],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?
        };
        let Some((session_id, nonce, ciphertext)) = row else {
            return Ok(None);
        };
        let Some(key) = self.session_key(&session_id, false)? else {
            return Ok(None);
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|e| PayloadError::Crypto(e.to_string()))?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|e| PayloadError::Crypto(e.to_string()))
    }

    /// Crypto-shred every payload of the given sessions: keys first, blobs
    /// second, so a crash between the steps still leaves the data unreadable.
    pub fn erase_sessions(&self, session_ids: &[String]) -> Result<u64> {
        for session_id in session_ids {
            let path = self.key_path(session_id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        let conn = self
            .conn
            .lock()
            .map_err(|_| PayloadError::Unavailable("lock poisoned".to_string()))?;
        let mut deleted = 0u64;
        for session_id in session_ids {
            deleted +=
                conn.execute("DELETE FROM payloads WHERE session_id = ?1", params![session_id])?
                    as u64;
        }
        Ok(deleted)
    }
}
