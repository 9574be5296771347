//! Integration tests for the cryptography engine: DEK lifecycle, the
//! unwrapped-key cache, and AEAD behavior against a real database.

mod support;

use strongroom::{
    crypto, CryptoEngine, EncryptedData, EncryptionKeyFilter, EncryptionKeyState, StoreError,
};

#[tokio::test]
async fn new_encryption_key_is_active_and_persisted() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);

    let key = engine.new_encryption_key(None).await.unwrap();
    assert_eq!(key.state, EncryptionKeyState::Active);
    assert!(!key.enc_key_material.is_empty());
    assert_eq!(engine.cached_key_count(), 1);

    // Visible through a plain persistence read
    let mut s = conn.begin().await.unwrap();
    let fetched = s.get_encryption_key(&key.id).await.unwrap();
    assert_eq!(fetched.id, key.id);
    assert_eq!(fetched.state, key.state);
    assert_eq!(fetched.enc_key_material, key.enc_key_material);
}

#[tokio::test]
async fn encrypt_then_decrypt_is_identity() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);
    let key = engine.new_encryption_key(None).await.unwrap();

    let plaintext = crypto::generate_random_bytes(4096);
    let (used_key, encrypted) = engine.encrypt_data(&key.id, &plaintext, None).await.unwrap();
    assert_eq!(used_key.id, key.id);
    assert_eq!(encrypted.nonce.len(), crypto::AEAD_NONCE_SIZE);
    assert_eq!(
        encrypted.ciphertext.len(),
        plaintext.len() + crypto::AEAD_TAG_SIZE
    );
    assert_ne!(&encrypted.ciphertext[..plaintext.len()], plaintext.as_slice());

    let (_, decrypted) = engine.decrypt_data(&key.id, &encrypted, None).await.unwrap();
    assert_eq!(decrypted, plaintext);
}

#[tokio::test]
async fn tampered_payload_fails_decryption() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);
    let key = engine.new_encryption_key(None).await.unwrap();

    let (_, encrypted) = engine
        .encrypt_data(&key.id, b"tamper target", None)
        .await
        .unwrap();

    let mut bad_ciphertext = encrypted.clone();
    bad_ciphertext.ciphertext[0] ^= 0x01;
    let err = engine
        .decrypt_data(&key.id, &bad_ciphertext, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Crypto(_)));

    let mut bad_nonce = encrypted.clone();
    bad_nonce.nonce[0] ^= 0x01;
    let err = engine.decrypt_data(&key.id, &bad_nonce, None).await.unwrap_err();
    assert!(matches!(err, StoreError::Crypto(_)));
}

#[tokio::test]
async fn inactive_key_cannot_seal_or_open() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);
    let key = engine.new_encryption_key(None).await.unwrap();

    let (_, encrypted) = engine.encrypt_data(&key.id, b"payload", None).await.unwrap();

    let parked = engine.mark_encryption_key_inactive(&key.id, None).await.unwrap();
    assert_eq!(parked.state, EncryptionKeyState::Inactive);
    assert_eq!(engine.cached_key_count(), 0);

    // The entry is still readable, just unusable for data encryption
    let entry = engine.get_encryption_key(&key.id, None).await.unwrap();
    assert_eq!(entry.state, EncryptionKeyState::Inactive);
    assert_eq!(engine.cached_key_count(), 0);

    let err = engine.encrypt_data(&key.id, b"payload", None).await.unwrap_err();
    assert!(matches!(err, StoreError::StateViolation(_)));
    let err = engine.decrypt_data(&key.id, &encrypted, None).await.unwrap_err();
    assert!(matches!(err, StoreError::StateViolation(_)));
}

#[tokio::test]
async fn reactivated_key_unwraps_back_into_service() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);
    let key = engine.new_encryption_key(None).await.unwrap();

    let (_, encrypted) = engine.encrypt_data(&key.id, b"survivor", None).await.unwrap();

    engine.mark_encryption_key_inactive(&key.id, None).await.unwrap();
    let restored = engine.mark_encryption_key_active(&key.id, None).await.unwrap();
    assert_eq!(restored.state, EncryptionKeyState::Active);
    assert_eq!(engine.cached_key_count(), 1);

    // Decryption works again via the re-unwrapped material
    let (_, decrypted) = engine.decrypt_data(&key.id, &encrypted, None).await.unwrap();
    assert_eq!(decrypted, b"survivor");
}

#[tokio::test]
async fn fresh_engine_unwraps_material_from_storage() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);
    let key = engine.new_encryption_key(None).await.unwrap();
    let (_, encrypted) = engine.encrypt_data(&key.id, b"cross engine", None).await.unwrap();

    // A second engine over the same database and KEK starts cold
    let second = support::test_engine(&conn);
    assert_eq!(second.cached_key_count(), 0);

    let (_, decrypted) = second.decrypt_data(&key.id, &encrypted, None).await.unwrap();
    assert_eq!(decrypted, b"cross engine");
    assert_eq!(second.cached_key_count(), 1);
}

#[tokio::test]
async fn listing_reconciles_the_cache() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);

    let k1 = engine.new_encryption_key(None).await.unwrap();
    let _k2 = engine.new_encryption_key(None).await.unwrap();
    assert_eq!(engine.cached_key_count(), 2);

    // A cold engine fills its cache from a listing pass
    let second = support::test_engine(&conn);
    second
        .list_encryption_keys(EncryptionKeyFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(second.cached_key_count(), 2);

    // After an out-of-engine deactivation, listing evicts the stale entry
    let mut s = conn.begin().await.unwrap();
    s.mark_encryption_key_inactive(&k1.id).await.unwrap();
    s.commit().await.unwrap();

    second
        .list_encryption_keys(EncryptionKeyFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(second.cached_key_count(), 1);
}

#[tokio::test]
async fn deleted_key_is_gone_and_evicted() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);
    let key = engine.new_encryption_key(None).await.unwrap();
    let (_, encrypted) = engine.encrypt_data(&key.id, b"doomed", None).await.unwrap();

    engine.delete_encryption_key(&key.id, None).await.unwrap();
    assert_eq!(engine.cached_key_count(), 0);

    let err = engine.decrypt_data(&key.id, &encrypted, None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn wrong_kek_fails_to_unwrap() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);
    let key = engine.new_encryption_key(None).await.unwrap();

    // An engine holding a different KEK cannot unwrap the stored material
    let impostor = CryptoEngine::with_kek(conn.clone(), support::unrelated_kek());
    let err = impostor.get_encryption_key(&key.id, None).await.unwrap_err();
    assert!(matches!(err, StoreError::Crypto(_)));
    assert_eq!(impostor.cached_key_count(), 0);
}

#[tokio::test]
async fn unknown_key_is_not_found() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);

    let missing = uuid::Uuid::new_v4().to_string();
    let err = engine.get_encryption_key(&missing, None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    let err = engine
        .decrypt_data(
            &missing,
            &EncryptedData::new(vec![0u8; 24], vec![0u8; 32]),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}
