//! # Strongroom
//!
//! An encrypted-at-rest, versioned key-value store backed by a relational
//! database.
//!
//! ## Overview
//!
//! Callers write named records whose values are symmetrically encrypted
//! before persistence; every write produces an immutable version; reads
//! decrypt on demand. Internally the crate manages a lifecycle of symmetric
//! **data encryption keys** (DEKs) protected by an asymmetric **key
//! encryption key** (KEK) held as a local certificate / private-key pair,
//! together with an append-only audit log of lifecycle events and a
//! singleton system-state machine.
//!
//! - Record values are sealed with **XChaCha20-Poly1305** (32-byte key,
//!   24-byte nonce, 16-byte tag) under the store's working DEK.
//! - DEKs are persisted only as **RSA-OAEP** ciphertext wrapped under the
//!   KEK public key; plaintext key material lives exclusively in a
//!   process-local, lock-protected cache and is zeroized on drop.
//! - Every entity mutation and its audit event commit in one transaction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use strongroom::{new_protected_kv_store, sqlite_options};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = new_protected_kv_store(
//!     sqlite_options(Path::new("/var/lib/strongroom/data.db")),
//!     log::LevelFilter::Debug,
//!     Path::new("/etc/strongroom/kek-cert.pem"),
//!     Path::new("/etc/strongroom/kek-key.pem"),
//! )
//! .await?;
//!
//! // Record a value; each write creates an immutable version
//! let (_record, version) = store
//!     .record_key_value("api-token", b"s3cr3t", chrono::Utc::now(), None)
//!     .await?;
//!
//! // Read it back, decrypted on demand
//! let value = store.get_value_of_key_at_version(&version, None).await?;
//! assert_eq!(value, b"s3cr3t");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`] - AEAD and KEK wrap/unwrap primitives
//! - [`engine`] - DEK lifecycle and the unwrapped-key cache
//! - [`persistence`] - transactional storage, audit trail, system state
//! - [`kv`] - the protected KV store surface
//! - [`models`] - entity definitions and state machines
//! - [`error`] - error types and Result alias

pub mod crypto;
pub mod engine;
pub mod error;
pub mod kv;
pub mod models;
pub mod persistence;

use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::ConnectOptions;

// ============================================================================
// Error Exports
// ============================================================================

/// Error type for protected KV store operations.
pub use error::StoreError;

/// Result type alias using [`StoreError`].
pub use error::Result;

// ============================================================================
// Crypto Exports
// ============================================================================

/// Encrypted payload with nonce and ciphertext.
pub use crypto::EncryptedData;

/// Key encryption key loaded from a certificate / private key pair.
pub use crypto::KeyEncryptionKey;

/// Secure key wrapper with automatic zeroization on drop.
pub use crypto::SecureKey;

// ============================================================================
// Model Exports
// ============================================================================

pub use models::{
    EncryptionKey, EncryptionKeyState, Record, RecordVersion, SystemEventAudit, SystemEventType,
    SystemParams, SystemState,
};

// ============================================================================
// Persistence Exports
// ============================================================================

/// Database connection pool handle.
pub use persistence::Connection;

/// One open database transaction wrapping one logical operation.
pub use persistence::Session;

/// Standard SQLite connect options with referential integrity on.
pub use persistence::sqlite_options;

pub use persistence::{EncryptionKeyFilter, RecordFilter, RecordVersionFilter, SystemEventFilter};

// ============================================================================
// Engine and Store Exports
// ============================================================================

/// The cryptography engine: DEK lifecycle, unwrapped-key cache, AEAD.
pub use engine::CryptoEngine;

/// The protected KV store surface.
pub use kv::ProtectedKvStore;

/// Initialize a protected KV store instance.
///
/// Connects to the database (logging SQL statements at `db_log_level`),
/// prepares the backing tables, loads the KEK from the certificate and
/// private key PEM files, and selects the working data encryption key.
pub async fn new_protected_kv_store(
    db_options: SqliteConnectOptions,
    db_log_level: log::LevelFilter,
    kek_cert_file: &Path,
    kek_key_file: &Path,
) -> Result<ProtectedKvStore> {
    let db_options = db_options.log_statements(db_log_level);

    let persistence = Connection::connect(db_options).await?;
    persistence.define_tables().await?;

    let engine = Arc::new(CryptoEngine::new(
        persistence.clone(),
        kek_cert_file,
        kek_key_file,
    )?);

    ProtectedKvStore::new(persistence, engine).await
}
