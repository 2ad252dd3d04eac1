use std::time::Duration;

use tablegate_contracts::{
    AttrValue, Attributes, ErrorKind, OwnershipCondition, Record, StorageCommand, StorageOutput,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tablegate_storage::{PgEngine, PgStoreError, StorageEngine};

const DEADLINE: Duration = Duration::from_secs(5);

fn test_db_url() -> Option<String> {
    std::env::var("TABLEGATE_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Connects a pool whose every connection is pinned to a fresh schema.
async fn isolated_engine(db_url: &str, max_connections: u32) -> PgEngine {
    let schema = format!("tablegate_test_{}", ulid::Ulid::new()).to_lowercase();

    let options = db_url
        .parse::<PgConnectOptions>()
        .expect("DB url should parse")
        .options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .expect("DB connect should succeed");

    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&pool)
        .await
        .expect("create schema should succeed");

    tablegate_storage::migrate(&pool)
        .await
        .expect("migrations should apply");
    tablegate_storage::migrate(&pool)
        .await
        .expect("migrations should be idempotent");

    PgEngine::from_pool(pool, Duration::from_secs(5))
}

fn pet(id: &str, owner: &str, name: &str, age: i64) -> Record {
    Record {
        id: id.to_string(),
        owner_id: owner.to_string(),
        created_at: "2026-10-16T00:00:00Z".to_string(),
        attributes: Attributes::from([
            ("name".to_string(), AttrValue::from(name)),
            ("type".to_string(), AttrValue::from("Cat")),
            ("age".to_string(), AttrValue::from(age)),
        ]),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn postgres_engine_enforces_ownership_in_the_write() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping postgres storage test; set TABLEGATE_TEST_DB_URL to enable");
        return;
    };
    let engine = isolated_engine(&db_url, 1).await;

    engine.put_item(pet("A", "P1", "Fluffy", 3)).await.unwrap();
    engine.put_item(pet("B", "P2", "Rex", 5)).await.unwrap();
    engine.put_item(pet("C", "P1", "Tom", 1)).await.unwrap();

    let dup = engine.put_item(pet("A", "P2", "Other", 9)).await.unwrap_err();
    assert_eq!(PgEngine::classify(&dup), ErrorKind::ConditionFailed);

    let stored = engine.get_item("A").await.unwrap().expect("A exists");
    assert_eq!(stored, pet("A", "P1", "Fluffy", 3));
    assert!(engine.get_item("missing").await.unwrap().is_none());

    let all = engine.scan().await.unwrap();
    assert_eq!(all.len(), 3);
    let mine = engine.query_by_owner("P1").await.unwrap();
    let ids = mine.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["A", "C"]);

    let rename = Attributes::from([("name".to_string(), AttrValue::from("Whiskers"))]);
    let denied = engine
        .update_if_owner("A", rename.clone(), &OwnershipCondition::new("P2"))
        .await
        .unwrap_err();
    assert_eq!(PgEngine::classify(&denied), ErrorKind::ConditionFailed);

    engine
        .update_if_owner("A", rename, &OwnershipCondition::new("P1"))
        .await
        .unwrap();
    let updated = engine.get_item("A").await.unwrap().expect("A exists");
    assert_eq!(updated.attributes["name"], AttrValue::from("Whiskers"));
    assert_eq!(updated.attributes["age"], AttrValue::from(3));

    let missing = engine
        .delete_if_owner("missing", &OwnershipCondition::new("P1"))
        .await
        .unwrap_err();
    assert_eq!(PgEngine::classify(&missing), ErrorKind::NotFound);

    let denied = engine
        .delete_if_owner("B", &OwnershipCondition::new("P1"))
        .await
        .unwrap_err();
    assert_eq!(PgEngine::classify(&denied), ErrorKind::ConditionFailed);

    engine
        .check_owner("B", &OwnershipCondition::new("P2"))
        .await
        .unwrap();
    engine
        .delete_if_owner("B", &OwnershipCondition::new("P2"))
        .await
        .unwrap();
    assert!(engine.get_item("B").await.unwrap().is_none());

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn postgres_rejects_owner_reassignment() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping postgres storage test; set TABLEGATE_TEST_DB_URL to enable");
        return;
    };
    let engine = isolated_engine(&db_url, 1).await;
    engine.put_item(pet("A", "P1", "Fluffy", 3)).await.unwrap();

    let storage = tablegate_storage::Storage::Postgres(engine.clone());
    assert!(storage.ping().await);

    let out = storage
        .execute(
            StorageCommand::QueryByOwner {
                owner_id: "P1".to_string(),
            },
            DEADLINE,
        )
        .await
        .unwrap();
    assert!(matches!(out, StorageOutput::Items(items) if items.len() == 1));

    // The schema refuses key changes even outside the engine API.
    let result = sqlx::query("UPDATE tablegate_records SET owner_id = 'P2' WHERE id = 'A'")
        .execute(engine.pool())
        .await;
    assert!(result.is_err(), "owner_id should be immutable");

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_write_after_concurrent_delete_is_not_found() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping postgres storage test; set TABLEGATE_TEST_DB_URL to enable");
        return;
    };
    let engine = isolated_engine(&db_url, 4).await;
    engine.put_item(pet("A", "P1", "Fluffy", 3)).await.unwrap();
    engine.put_item(pet("B", "P1", "Rex", 5)).await.unwrap();

    for id in ["A", "B"] {
        // Another session removes the row and holds its lock while the owner's write queues.
        let mut tx = engine.pool().begin().await.unwrap();
        sqlx::query("DELETE FROM tablegate_records WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .unwrap();

        let pending = {
            let engine = engine.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                let owner = OwnershipCondition::new("P1");
                if id == "A" {
                    engine.delete_if_owner(&id, &owner).await
                } else {
                    let changes =
                        Attributes::from([("name".to_string(), AttrValue::from("Whiskers"))]);
                    engine.update_if_owner(&id, changes, &owner).await
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.commit().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(
            matches!(err, PgStoreError::ItemNotFound),
            "guarded write on {id} after a concurrent delete: {err}"
        );
        assert_eq!(PgEngine::classify(&err), ErrorKind::NotFound);
    }

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_concurrent_owner_deletes_succeed_exactly_once() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping postgres storage test; set TABLEGATE_TEST_DB_URL to enable");
        return;
    };
    let engine = isolated_engine(&db_url, 8).await;
    engine.put_item(pet("A", "P1", "Fluffy", 3)).await.unwrap();

    let handles = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .delete_if_owner("A", &OwnershipCondition::new("P1"))
                    .await
            })
        })
        .collect::<Vec<_>>();

    let mut deleted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => deleted += 1,
            Err(err) => assert_eq!(PgEngine::classify(&err), ErrorKind::NotFound, "{err}"),
        }
    }
    assert_eq!(deleted, 1);

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_owner_update_racing_owner_delete_never_reports_a_denial() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping postgres storage test; set TABLEGATE_TEST_DB_URL to enable");
        return;
    };
    let engine = isolated_engine(&db_url, 4).await;

    for round in 0..16 {
        let id = format!("R{round}");
        engine.put_item(pet(&id, "P1", "Fluffy", 3)).await.unwrap();

        let update = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let changes = Attributes::from([("age".to_string(), AttrValue::from(4))]);
                engine
                    .update_if_owner(&id, changes, &OwnershipCondition::new("P1"))
                    .await
            })
        };
        let delete = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .delete_if_owner(&id, &OwnershipCondition::new("P1"))
                    .await
            })
        };

        delete.await.unwrap().unwrap();
        if let Err(err) = update.await.unwrap() {
            assert_eq!(PgEngine::classify(&err), ErrorKind::NotFound, "{err}");
        }
        assert!(engine.get_item(&id).await.unwrap().is_none());
    }

    engine.close().await;
}
