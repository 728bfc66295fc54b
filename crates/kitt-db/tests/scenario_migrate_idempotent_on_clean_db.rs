//! Migrations bring a fresh database to the current schema version and are
//! a no-op when run again.

mod common;

#[tokio::test]
async fn migrate_is_idempotent() {
    let (_dir, pool) = common::test_pool().await;

    // connect() already migrated; version must be current.
    assert_eq!(
        kitt_db::current_version(&pool).await.unwrap(),
        kitt_db::SCHEMA_VERSION
    );

    // Second run applies nothing and does not fail.
    kitt_db::migrate(&pool).await.unwrap();
    assert_eq!(
        kitt_db::current_version(&pool).await.unwrap(),
        kitt_db::SCHEMA_VERSION
    );

    let status = kitt_db::status(&pool).await.unwrap();
    assert!(status.ok);
    assert!(status.has_runs_table);
    assert_eq!(status.schema_version, kitt_db::SCHEMA_VERSION);
}

#[tokio::test]
async fn each_version_is_recorded_once() {
    let (_dir, pool) = common::test_pool().await;
    kitt_db::migrate(&pool).await.unwrap();
    kitt_db::migrate(&pool).await.unwrap();

    let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_version")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, kitt_db::SCHEMA_VERSION);
}
