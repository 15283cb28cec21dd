use std::time::Duration;

use harbor::{JobId, NewJob, StateData};
use harbor_testkit::TestDatabase;

#[tokio::test]
async fn batch_applies_every_operation_in_order() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let connection = db.connection()?;
    let job_id = connection
        .create_expired_job(NewJob::new(serde_json::json!({"m": "Run"}), serde_json::json!([])))
        .await?;

    let mut batch = connection.create_write_batch();
    batch
        .set_job_state(job_id, StateData::new("Processing").with_data("Worker", "w1"))?
        .add_job_state(job_id, StateData::new("Heartbeat"))?
        .set_job_state(job_id, StateData::new("Succeeded").with_reason("done"))?
        .persist_job(job_id)?
        .increment_counter("stats:succeeded")?
        .increment_counter("stats:succeeded")?
        .decrement_counter_with_expiry("stats:succeeded", Duration::from_secs(3600))?
        .add_to_set_with_score("schedule", "a", 3.0)?
        .add_to_set_with_score("schedule", "a", 1.0)?
        .add_range_to_set("schedule", ["b", "c"])?
        .remove_from_set("schedule", "c")?
        .insert_to_list("succeeded", "1")?
        .insert_to_list("succeeded", "2")?
        .insert_to_list("succeeded", "3")?
        .set_range_in_hash("recurring:x", [("Cron", "* * * * *"), ("Queue", "default")])?
        .set_range_in_hash("recurring:x", [("Queue", "critical")])?
        .enqueue("default", job_id)?;
    assert_eq!(batch.len(), 17);
    batch.commit().await?;

    let state = connection.get_state_data(job_id).await?.expect("state");
    assert_eq!(state.name, "Succeeded");
    assert_eq!(state.reason.as_deref(), Some("done"));
    let data = connection.get_job_data(job_id).await?.expect("job");
    assert_eq!(data.state_name.as_deref(), Some("Succeeded"));
    assert!(data.expire_at.is_none());
    assert_eq!(db.count("state").await?, 3);

    assert_eq!(connection.get_counter("stats:succeeded").await?, 1);
    assert_eq!(
        connection
            .get_first_by_lowest_score_from_set("schedule", 0.0, 10.0)
            .await?
            .as_deref(),
        Some("b")
    );
    assert_eq!(connection.get_set_count("schedule").await?, 2);
    assert_eq!(
        connection.get_all_items_from_list("succeeded").await?,
        vec!["3", "2", "1"]
    );
    assert_eq!(
        connection.get_value_from_hash("recurring:x", "Queue").await?.as_deref(),
        Some("critical")
    );
    assert_eq!(db.count("jobqueue").await?, 1);

    db.cleanup().await
}

#[tokio::test]
async fn failing_operation_discards_the_whole_batch() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let connection = db.connection()?;

    let mut batch = connection.create_write_batch();
    batch
        .increment_counter("stats:succeeded")?
        .add_to_set("processing", "job-1")?
        .insert_to_list("log", "entry")?
        .enqueue("default", JobId(1))?
        // No such job: the state row violates its foreign key.
        .set_job_state(JobId(i64::MAX), StateData::new("Failed"))?;

    let result = batch.commit().await;
    assert!(matches!(result, Err(harbor::Error::Database(_))));

    assert_eq!(connection.get_counter("stats:succeeded").await?, 0);
    assert_eq!(connection.get_set_count("processing").await?, 0);
    assert_eq!(connection.get_list_count("log").await?, 0);
    assert_eq!(db.count("jobqueue").await?, 0);
    assert_eq!(db.count("state").await?, 0);

    db.cleanup().await
}

#[tokio::test]
async fn trim_list_keeps_the_requested_window() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let connection = db.connection()?;

    let mut batch = connection.create_write_batch();
    for value in ["0", "1", "2", "3", "4"] {
        batch.insert_to_list("recent", value)?;
    }
    batch.insert_to_list("other", "kept")?;
    batch.trim_list("recent", 1, 2)?;
    batch.commit().await?;

    assert_eq!(connection.get_all_items_from_list("recent").await?, vec!["2", "1"]);
    assert_eq!(connection.get_list_count("other").await?, 1);

    let mut batch = connection.create_write_batch();
    batch.trim_list("recent", 3, 1)?;
    batch.commit().await?;
    assert_eq!(connection.get_list_count("recent").await?, 0);

    db.cleanup().await
}

#[tokio::test]
async fn expire_and_persist_collections() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let connection = db.connection()?;

    let mut batch = connection.create_write_batch();
    batch
        .add_to_set("s", "v")?
        .insert_to_list("l", "v")?
        .set_range_in_hash("h", [("f", "v")])?
        .expire_set("s", Duration::from_secs(3600))?
        .expire_list("l", Duration::from_secs(3600))?
        .expire_hash("h", Duration::from_secs(3600))?;
    batch.commit().await?;

    for ttl in [
        connection.get_set_ttl("s").await?,
        connection.get_list_ttl("l").await?,
        connection.get_hash_ttl("h").await?,
    ] {
        let ttl = ttl.expect("expiry set");
        assert!(ttl > Duration::from_secs(3500) && ttl <= Duration::from_secs(3600));
    }

    let mut batch = connection.create_write_batch();
    batch.persist_set("s")?.persist_list("l")?.persist_hash("h")?;
    batch.commit().await?;

    assert!(connection.get_set_ttl("s").await?.is_none());
    assert!(connection.get_list_ttl("l").await?.is_none());
    assert!(connection.get_hash_ttl("h").await?.is_none());

    let mut batch = connection.create_write_batch();
    batch.remove_set("s")?.remove_hash("h")?.remove_from_list("l", "v")?;
    batch.commit().await?;
    assert_eq!(connection.get_set_count("s").await?, 0);
    assert!(connection.get_all_entries_from_hash("h").await?.is_none());
    assert_eq!(connection.get_list_count("l").await?, 0);

    db.cleanup().await
}

#[tokio::test]
async fn expire_job_sets_expiry() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::connect().await? else {
        return Ok(());
    };
    let connection = db.connection()?;
    let job_id = connection
        .create_expired_job(NewJob::new(serde_json::json!({}), serde_json::json!([])))
        .await?;
    assert!(connection.get_job_data(job_id).await?.unwrap().expire_at.is_some());

    let mut batch = connection.create_write_batch();
    batch.persist_job(job_id)?;
    batch.commit().await?;
    assert!(connection.get_job_data(job_id).await?.unwrap().expire_at.is_none());

    let mut batch = connection.create_write_batch();
    batch.expire_job(job_id, Duration::from_secs(600))?;
    batch.commit().await?;
    assert!(connection.get_job_data(job_id).await?.unwrap().expire_at.is_some());

    db.cleanup().await
}
