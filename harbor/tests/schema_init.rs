use std::time::Duration;

use harbor::schema::migrations;
use harbor::schema::SCHEMA_LOCK_KEY;
use harbor::{
    AmbientTransaction, ConnectionProvider, Error, InitOutcome, IsolationLevel, JobId, NewJob,
    SchemaInitializer, SchemaName, StateData, Storage, StorageConnection, TransactionMode,
};
use harbor_testkit::TestDatabase;
use sqlx::Connection;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn initialize_until_done(initializer: &SchemaInitializer) -> anyhow::Result<InitOutcome> {
    loop {
        match initializer.initialize().await? {
            InitOutcome::Skipped => tokio::time::sleep(Duration::from_millis(25)).await,
            outcome => return Ok(outcome),
        }
    }
}

#[tokio::test]
async fn second_run_is_a_no_op() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    assert_eq!(db.version().await?, migrations::latest_version());

    let initializer = SchemaInitializer::new(db.provider(), db.schema().clone());
    let outcome = initialize_until_done(&initializer).await?;
    assert_eq!(
        outcome,
        InitOutcome::UpToDate {
            version: migrations::latest_version()
        }
    );
    assert_eq!(db.version().await?, migrations::latest_version());
    assert_eq!(db.count("schema").await?, 1);

    db.cleanup().await
}

#[tokio::test]
async fn fresh_schema_migrates_from_baseline() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let schema = SchemaName::new(format!("harbor_fresh_{}", Uuid::new_v4().simple()))?;
    let initializer = SchemaInitializer::new(db.provider(), schema.clone());

    let outcome = initialize_until_done(&initializer).await?;
    assert_eq!(
        outcome,
        InitOutcome::Migrated {
            from: 1,
            to: migrations::latest_version()
        }
    );

    sqlx::query(&format!("DROP SCHEMA {} CASCADE", schema.quoted()))
        .execute(db.pool())
        .await?;
    db.cleanup().await
}

#[tokio::test]
async fn held_lock_skips_initialization() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let mut holder = db.pool().acquire().await?;
    let taken: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .fetch_one(&mut *holder)
        .await?;

    if taken {
        let initializer = SchemaInitializer::new(db.provider(), db.schema().clone());
        assert_eq!(initializer.initialize().await?, InitOutcome::Skipped);
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *holder)
            .await?;
    }

    drop(holder);
    db.cleanup().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_initializers_migrate_once() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let schema = SchemaName::new(format!("harbor_race_{}", Uuid::new_v4().simple()))?;

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let initializer = SchemaInitializer::new(db.provider(), schema.clone());
            tokio::spawn(async move { initialize_until_done(&initializer).await })
        })
        .collect();

    let mut migrated = 0;
    for run in futures::future::join_all(runs).await {
        if let InitOutcome::Migrated { .. } = run?? {
            migrated += 1;
        }
    }
    assert_eq!(migrated, 1);

    let version: i32 = sqlx::query_scalar(&format!("SELECT version FROM {}", schema.table("schema")))
        .fetch_one(db.pool())
        .await?;
    assert_eq!(version, migrations::latest_version());

    sqlx::query(&format!("DROP SCHEMA {} CASCADE", schema.quoted()))
        .execute(db.pool())
        .await?;
    db.cleanup().await
}

#[tokio::test]
async fn storage_open_prepares_schema() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let storage = Storage::open(db.provider(), db.options().with_prepare_schema(true)).await?;
    assert!(storage.options().prepare_schema_if_necessary);
    let connection = storage.connection()?;
    assert_eq!(connection.get_counter("anything").await?, 0);

    db.cleanup().await
}

#[tokio::test]
async fn storage_opens_on_a_spawned_task() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let schema = SchemaName::new(format!("harbor_spawned_{}", Uuid::new_v4().simple()))?;
    let options = db
        .options()
        .with_schema_name(schema.as_str())
        .with_prepare_schema(true);
    let provider = db.provider();

    let opened = tokio::spawn(Storage::open(provider.clone(), options)).await??;

    // Another test may hold the initialization lock; make sure the schema is in place.
    let initializer = SchemaInitializer::new(provider, schema.clone());
    initialize_until_done(&initializer).await?;

    let connection = opened.connection()?;
    assert_eq!(connection.get_counter("stats:succeeded").await?, 0);

    sqlx::query(&format!("DROP SCHEMA {} CASCADE", schema.quoted()))
        .execute(db.pool())
        .await?;
    db.cleanup().await
}

#[tokio::test]
async fn failed_migration_keeps_version_and_releases_lock() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let url = std::env::var("DATABASE_URL")?;
    // One connection, so the session that ran the initializer can be inspected afterwards.
    let single = PgPoolOptions::new().max_connections(1).connect(&url).await?;

    sqlx::query(&format!("UPDATE {} SET version = 3", db.schema().table("schema")))
        .execute(db.pool())
        .await?;
    sqlx::query(&format!("DROP TABLE {}", db.schema().table("counter")))
        .execute(db.pool())
        .await?;

    let initializer =
        SchemaInitializer::new(ConnectionProvider::pooled(single.clone()), db.schema().clone());
    let result = loop {
        match initializer.initialize().await {
            Ok(InitOutcome::Skipped) => tokio::time::sleep(Duration::from_millis(25)).await,
            other => break other,
        }
    };
    assert!(
        matches!(result, Err(Error::Migration { version: 4, .. })),
        "unexpected outcome: {result:?}"
    );
    assert_eq!(db.version().await?, 3);

    let held: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM pg_locks
        WHERE locktype = 'advisory'
          AND pid = pg_backend_pid()
          AND classid = ($1 >> 32)::oid
          AND objid = ($1 & 4294967295)::oid
          AND objsubid = 1
        "#,
    )
    .bind(SCHEMA_LOCK_KEY)
    .fetch_one(&single)
    .await?;
    assert_eq!(held, 0, "initializer session still holds the schema lock");

    single.close().await;
    db.cleanup().await
}

#[tokio::test]
async fn ambient_work_commits_with_the_caller() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let ambient = AmbientTransaction::new(db.pool().begin().await?);
    let connection = StorageConnection::new(ConnectionProvider::ambient(ambient.clone()), &db.options())?;

    let job_id = connection
        .create_expired_job(NewJob::new(serde_json::json!({}), serde_json::json!([])))
        .await?;
    let mut batch = connection.create_write_batch();
    batch
        .set_job_state(job_id, StateData::new("Enqueued"))?
        .enqueue("default", job_id)?;
    batch.commit().await?;

    // Not visible outside the caller's transaction yet.
    assert_eq!(db.count("job").await?, 0);
    assert_eq!(db.count("jobqueue").await?, 0);

    ambient.clone().into_inner().await?.commit().await?;
    assert_eq!(db.count("job").await?, 1);
    assert_eq!(db.count("jobqueue").await?, 1);

    let after = connection.get_counter("x").await;
    assert!(matches!(after, Err(Error::ResourceReleased(_))));

    db.cleanup().await
}

#[tokio::test]
async fn failed_batch_rolls_back_only_its_savepoint() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let ambient = AmbientTransaction::new(db.pool().begin().await?);
    let provider = ConnectionProvider::ambient(ambient.clone());
    let connection = StorageConnection::new(provider.clone(), &db.options())?;

    let job_id = connection
        .create_expired_job(NewJob::new(serde_json::json!({}), serde_json::json!([])))
        .await?;

    let mut failing = connection.create_write_batch();
    failing
        .increment_counter("stats:failed")?
        .set_job_state(JobId(i64::MAX), StateData::new("Failed"))?;
    assert!(failing.commit().await.is_err());

    // The caller's transaction is still usable after the savepoint rollback.
    let mut batch = connection.create_write_batch();
    batch.increment_counter("stats:succeeded")?;
    batch.commit().await?;

    {
        let mut scope = provider.acquire().await?;
        assert!(scope.is_ambient());
        let tx = scope.begin_transaction(IsolationLevel::Serializable).await?;
        assert_eq!(tx.mode(), TransactionMode::Savepoint);
        tx.rollback().await?;
    }

    let mut tx = ambient.into_inner().await?;
    let inner_ok: bool = sqlx::query_scalar("SELECT TRUE").fetch_one(&mut *tx).await?;
    assert!(inner_ok);
    tx.commit().await?;

    let connection = db.connection()?;
    assert!(connection.get_job_data(job_id).await?.is_some());
    assert_eq!(connection.get_counter("stats:failed").await?, 0);
    assert_eq!(connection.get_counter("stats:succeeded").await?, 1);

    db.cleanup().await
}

#[tokio::test]
async fn pooled_scope_owns_its_transaction() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let mut scope = db.provider().acquire().await?;
    assert!(!scope.is_ambient());
    {
        let mut tx = scope.begin_transaction(IsolationLevel::RepeatableRead).await?;
        assert_eq!(tx.mode(), TransactionMode::Owned);
        let level: String = sqlx::query_scalar("SHOW transaction_isolation")
            .fetch_one(tx.connection())
            .await?;
        assert_eq!(level, "repeatable read");
        tx.commit().await?;
    }
    scope.release();
    assert!(scope.is_released());
    assert!(matches!(
        scope.connection(),
        Err(Error::ResourceReleased(_))
    ));

    let mut conn = db.pool().acquire().await?;
    conn.ping().await?;
    drop(conn);
    db.cleanup().await
}
