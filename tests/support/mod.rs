//! Shared helpers for integration tests: per-test SQLite database, schema
//! bootstrap, and a runtime-generated RSA key encryption key.
#![allow(dead_code)]

use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use strongroom::{sqlite_options, Connection, CryptoEngine, KeyEncryptionKey};

/// RSA keygen is expensive; generate once per test binary and clone.
static TEST_RSA_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A unique temporary DB file per test
pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("strongroom_ut_{}.db", Uuid::new_v4()))
}

/// Fresh connection with the backing tables created
pub async fn test_connection() -> Connection {
    init_tracing();
    let conn = Connection::connect(sqlite_options(&temp_db_path()))
        .await
        .expect("database connection must open");
    conn.define_tables()
        .await
        .expect("backing tables must be created");
    conn
}

/// The shared test KEK (same RSA key pair for every call)
pub fn test_kek() -> KeyEncryptionKey {
    let private = TEST_RSA_KEY
        .get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA keygen must succeed"))
        .clone();
    KeyEncryptionKey::from_private_key(private)
}

/// A KEK that is NOT the shared test KEK, for wrong-key scenarios
pub fn unrelated_kek() -> KeyEncryptionKey {
    let private = RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA keygen must succeed");
    KeyEncryptionKey::from_private_key(private)
}

/// Cryptography engine over the given connection using the shared test KEK
pub fn test_engine(conn: &Connection) -> Arc<CryptoEngine> {
    Arc::new(CryptoEngine::with_kek(conn.clone(), test_kek()))
}
