//! End-to-end tests of the protected KV store surface.

mod support;

use chrono::{Duration, Utc};

use strongroom::{ProtectedKvStore, StoreError};

async fn test_store(conn: &strongroom::Connection) -> ProtectedKvStore {
    let engine = support::test_engine(conn);
    ProtectedKvStore::new(conn.clone(), engine)
        .await
        .expect("store init must succeed")
}

#[tokio::test]
async fn end_to_end_round_trip() {
    let conn = support::test_connection().await;
    let store = test_store(&conn).await;

    let value1 = b"first value".to_vec();
    let value2 = b"second value".to_vec();
    let t1 = Utc::now() - Duration::seconds(5);
    let t2 = Utc::now();

    let (record, v1) = store
        .record_key_value("testkey1", &value1, t1, None)
        .await
        .unwrap();
    assert_ne!(v1.enc_value, value1);

    let (listed_record, versions) = store.list_key_versions("testkey1", None).await.unwrap();
    assert_eq!(listed_record.id, record.id);
    assert_eq!(versions.len(), 1);

    let read_back = store
        .get_value_of_key_at_version_id(&v1.id, None)
        .await
        .unwrap();
    assert_eq!(read_back, value1);

    let (_, v2) = store
        .record_key_value("testkey1", &value2, t2, None)
        .await
        .unwrap();

    let (_, versions) = store.list_key_versions("testkey1", None).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|v| v.record_id == record.id));
    // Newest first
    assert_eq!(versions[0].id, v2.id);

    let read_back = store.get_value_of_key_at_version(&v2, None).await.unwrap();
    assert_eq!(read_back, value2);

    store.delete_key("testkey1", None).await.unwrap();
    let err = store.list_key_versions("testkey1", None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn store_init_generates_key_once_and_reuses_newest_active() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);

    // Empty database: the first store mints its own working key
    let store1 = ProtectedKvStore::new(conn.clone(), engine.clone())
        .await
        .unwrap();
    let minted = store1.working_key().id.clone();

    // Same database: the second store adopts the existing active key
    let store2 = ProtectedKvStore::new(conn.clone(), engine.clone())
        .await
        .unwrap();
    assert_eq!(store2.working_key().id, minted);

    // A newer active key becomes the working key for subsequent stores
    let newer = engine.new_encryption_key(None).await.unwrap();
    let store3 = ProtectedKvStore::new(conn.clone(), engine.clone())
        .await
        .unwrap();
    assert_eq!(store3.working_key().id, newer.id);
}

#[tokio::test]
async fn stale_working_key_makes_writes_fail() {
    let conn = support::test_connection().await;
    let engine = support::test_engine(&conn);
    let store = ProtectedKvStore::new(conn.clone(), engine.clone())
        .await
        .unwrap();

    let (_, version) = store
        .record_key_value("doomed", b"value", Utc::now(), None)
        .await
        .unwrap();

    // Out-of-band deactivation of the working key
    engine
        .mark_encryption_key_inactive(&store.working_key().id, None)
        .await
        .unwrap();

    let err = store
        .record_key_value("doomed", b"another", Utc::now(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StateViolation(_)));

    // Reads under the parked key fail too
    let err = store
        .get_value_of_key_at_version(&version, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StateViolation(_)));
}

#[tokio::test]
async fn caller_session_joins_one_transaction() {
    let conn = support::test_connection().await;
    let store = test_store(&conn).await;

    // Joined session, dropped without commit: nothing sticks
    {
        let mut session = conn.begin().await.unwrap();
        store
            .record_key_value("pending", b"uncommitted", Utc::now(), Some(&mut session))
            .await
            .unwrap();

        // Visible inside the same transaction
        let (_, versions) = store
            .list_key_versions("pending", Some(&mut session))
            .await
            .unwrap();
        assert_eq!(versions.len(), 1);
        // No commit: rollback on drop
    }

    let err = store.list_key_versions("pending", None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    // Joined session, committed: the write sticks
    let mut session = conn.begin().await.unwrap();
    let (_, version) = store
        .record_key_value("pending", b"committed", Utc::now(), Some(&mut session))
        .await
        .unwrap();
    session.commit().await.unwrap();

    let value = store
        .get_value_of_key_at_version_id(&version.id, None)
        .await
        .unwrap();
    assert_eq!(value, b"committed");
}

#[tokio::test]
async fn deleting_unknown_key_is_not_found() {
    let conn = support::test_connection().await;
    let store = test_store(&conn).await;

    let err = store.delete_key("never-written", None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn values_of_distinct_keys_stay_separate() {
    let conn = support::test_connection().await;
    let store = test_store(&conn).await;

    let (record_a, va) = store
        .record_key_value("alpha", b"value-a", Utc::now(), None)
        .await
        .unwrap();
    let (record_b, vb) = store
        .record_key_value("beta", b"value-b", Utc::now(), None)
        .await
        .unwrap();
    assert_ne!(record_a.id, record_b.id);

    assert_eq!(
        store.get_value_of_key_at_version(&va, None).await.unwrap(),
        b"value-a"
    );
    assert_eq!(
        store.get_value_of_key_at_version(&vb, None).await.unwrap(),
        b"value-b"
    );

    // Deleting one key leaves the other intact
    store.delete_key("alpha", None).await.unwrap();
    let (_, versions) = store.list_key_versions("beta", None).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].id, vb.id);
}
