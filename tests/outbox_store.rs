use outbox::{
    mutation::{Mutation, NewMutation},
    notify::ChangeNotifier,
    persist::{StorageError, outbox::Outbox, records::{RecordStore, RemoteChange}, sqlite::SqliteDb},
    types::OpKind,
    writer::DirectWriter,
};
use serde_json::json;
use tempfile::tempdir;

fn ids(batch: &[Mutation]) -> Vec<&str> {
    batch.iter().map(|m| m.target_id.as_str()).collect()
}

#[test]
fn peek_is_ordered_bounded_and_side_effect_free() {
    let db = SqliteDb::open_in_memory().expect("open");
    let outbox = Outbox::new(db);
    for i in 0..5 {
        outbox
            .enqueue(NewMutation::put("customers", i.to_string(), json!({"n": i})))
            .expect("enqueue");
    }

    let first = outbox.peek_batch(3).expect("peek");
    assert_eq!(ids(&first), vec!["0", "1", "2"]);
    assert!(first.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(outbox.peek_batch(3).expect("peek"), first);
    assert!(outbox.peek_batch(0).expect("peek").is_empty());
    assert_eq!(outbox.peek_batch(50).expect("peek").len(), 5);
}

#[test]
fn mark_complete_is_exact_and_idempotent() {
    let outbox = Outbox::new(SqliteDb::open_in_memory().expect("open"));
    let a = outbox
        .enqueue(NewMutation::put("customers", "a", json!({})))
        .expect("a");
    let b = outbox.enqueue(NewMutation::delete("customers", "b")).expect("b");

    assert_eq!(outbox.mark_complete([a.id.as_str()]).expect("complete"), 1);
    assert_eq!(outbox.mark_complete([a.id.as_str()]).expect("again"), 0);
    assert_eq!(outbox.mark_complete(["unknown"]).expect("unknown"), 0);
    assert_eq!(outbox.mark_complete(Vec::<String>::new()).expect("empty"), 0);

    let rest = outbox.peek_batch(10).expect("peek");
    assert_eq!(rest, vec![b]);
}

#[test]
fn seq_is_never_reused_after_completion() {
    let outbox = Outbox::new(SqliteDb::open_in_memory().expect("open"));
    let first = outbox
        .enqueue(NewMutation::put("customers", "1", json!({})))
        .expect("enqueue");
    outbox.mark_complete([first.id.as_str()]).expect("complete");

    let second = outbox
        .enqueue(NewMutation::put("customers", "2", json!({})))
        .expect("enqueue");
    assert!(second.seq > first.seq);
    assert_eq!(outbox.latest_seq().expect("latest"), second.seq);
}

#[test]
fn duplicate_and_invalid_mutations_are_rejected() {
    let outbox = Outbox::new(SqliteDb::open_in_memory().expect("open"));
    let mutation = NewMutation::put("customers", "1", json!({"name": "a"}));
    outbox.enqueue(mutation.clone()).expect("enqueue");

    let dup = outbox.enqueue(mutation).expect_err("duplicate");
    assert!(matches!(dup, StorageError::Duplicate(_)));

    let missing = NewMutation {
        data: None,
        ..NewMutation::put("customers", "2", json!({}))
    };
    let err = outbox.enqueue(missing).expect_err("invalid");
    assert!(matches!(err, StorageError::Invalid(_)));
    assert_eq!(outbox.pending_count().expect("count"), 1);
}

#[test]
fn pending_rows_survive_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("outbox.db");

    let expected = {
        let db = SqliteDb::open(&path).expect("open");
        let writer = DirectWriter::new(db.clone(), ChangeNotifier::new());
        writer.put("customers", "1", json!({"name": "a"})).expect("put");
        writer.delete("customers", "1").expect("delete");
        Outbox::new(db).peek_batch(10).expect("peek")
    };

    let db = SqliteDb::open(&path).expect("reopen");
    let outbox = Outbox::new(db.clone());
    assert_eq!(outbox.peek_batch(10).expect("peek"), expected);

    let next = outbox
        .enqueue(NewMutation::put("customers", "2", json!({})))
        .expect("enqueue");
    assert!(next.seq > expected[1].seq);
    assert!(next.tx_id > expected[1].tx_id);
}

#[test]
fn next_transaction_groups_by_tx_id_of_oldest_row() {
    let db = SqliteDb::open_in_memory().expect("open");
    let writer = DirectWriter::new(db.clone(), ChangeNotifier::new());
    let outbox = Outbox::new(db);

    outbox
        .enqueue_raw(r#"{"op":"DELETE","type":"customers","id":"x"}"#, None)
        .expect("raw");
    writer
        .transaction(|batch| {
            batch.put("customers", "1", json!({}))?;
            batch.put("customers", "2", json!({}))?;
            Ok(())
        })
        .expect("tx");
    writer.put("customers", "3", json!({})).expect("put");

    let head = outbox.next_transaction().expect("next");
    assert_eq!(ids(&head), vec!["x"]);
    assert_eq!(head[0].tx_id, None);
    outbox.mark_complete(head.iter().map(|m| m.id.as_str())).expect("complete");

    let grouped = outbox.next_transaction().expect("next");
    assert_eq!(ids(&grouped), vec!["1", "2"]);
    outbox.mark_complete(grouped.iter().map(|m| m.id.as_str())).expect("complete");

    assert_eq!(ids(&outbox.next_transaction().expect("next")), vec!["3"]);
}

#[test]
fn raw_sql_insert_is_read_like_any_other_row() {
    let db = SqliteDb::open_in_memory().expect("open");
    db.execute(
        "INSERT INTO outbox(tx_id, payload) VALUES (?1, ?2)",
        rusqlite::params![
            42i64,
            r#"{"op":"PUT","type":"customers","id":42,"data":{"name":"Customer 42"}}"#
        ],
    )
    .expect("insert");

    let pending = Outbox::new(db).peek_batch(10).expect("peek");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].op, OpKind::Put);
    assert_eq!(pending[0].target_id, "42");
    assert_eq!(pending[0].tx_id, Some(42));
    assert!(!pending[0].id.is_empty());
}

#[test]
fn malformed_and_future_version_rows_surface_as_malformed() {
    let outbox = Outbox::new(SqliteDb::open_in_memory().expect("open"));
    let seq = outbox
        .enqueue_raw(r#"{"op":"PUT","type":"customers","id":"1"}"#, None)
        .expect("raw");
    let err = outbox.peek_batch(10).expect_err("missing data");
    assert!(err.is_malformed());
    assert!(matches!(err, StorageError::Malformed { seq: s, .. } if s == seq));
    assert!(outbox.discard(seq).expect("discard"));
    assert!(!outbox.discard(seq).expect("discard twice"));

    outbox
        .enqueue_raw(
            r#"{"format_version":99,"entry":{"op":"DELETE","type":"customers","id":"1"}}"#,
            None,
        )
        .expect("raw");
    assert!(outbox.peek_batch(10).expect_err("future version").is_malformed());
}

#[test]
fn direct_write_updates_record_and_outbox_together() {
    let db = SqliteDb::open_in_memory().expect("open");
    let notifier = ChangeNotifier::new();
    let writer = DirectWriter::new(db.clone(), notifier.clone());
    let records = RecordStore::new(db.clone(), notifier);
    let outbox = Outbox::new(db);

    writer.put("customers", "1", json!({"name": "a"})).expect("put");
    assert_eq!(
        records.get("customers", "1").expect("get").map(|r| r.data),
        Some(json!({"name": "a"}))
    );

    let err = writer
        .transaction(|batch| {
            batch.put("customers", "2", json!({"name": "b"}))?;
            batch.push(NewMutation {
                data: None,
                ..NewMutation::put("customers", "3", json!({}))
            })?;
            Ok(())
        })
        .expect_err("rolled back");
    assert!(matches!(err, StorageError::Invalid(_)));
    assert_eq!(records.get("customers", "2").expect("get"), None);
    assert_eq!(outbox.pending_count().expect("count"), 1);

    writer.delete("customers", "1").expect("delete");
    assert!(records.list("customers").expect("list").is_empty());
    assert_eq!(outbox.pending_count().expect("count"), 2);
}

#[test]
fn remote_changes_touch_records_but_not_outbox() {
    let db = SqliteDb::open_in_memory().expect("open");
    let records = RecordStore::new(db.clone(), ChangeNotifier::new());

    let applied = records
        .apply_remote(&[
            RemoteChange {
                op: OpKind::Put,
                table: "customers".to_string(),
                id: "b".to_string(),
                data: Some(json!({"name": "b"})),
            },
            RemoteChange {
                op: OpKind::Put,
                table: "customers".to_string(),
                id: "a".to_string(),
                data: Some(json!({"name": "a"})),
            },
        ])
        .expect("apply");
    assert_eq!(applied, 2);

    let listed: Vec<String> = records
        .list("customers")
        .expect("list")
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(listed, vec!["a", "b"]);
    assert_eq!(Outbox::new(db).pending_count().expect("count"), 0);
}

#[test]
fn prune_forgets_old_completion_records() {
    let outbox = Outbox::new(SqliteDb::open_in_memory().expect("open"));
    let mutation = NewMutation::put("customers", "1", json!({}));
    let stored = outbox.enqueue(mutation.clone()).expect("enqueue");
    outbox.mark_complete([stored.id.as_str()]).expect("complete");

    assert_eq!(outbox.prune_completed(stored.seq).expect("prune"), 1);
    // Once pruned, the id is accepted again.
    outbox.enqueue(mutation).expect("re-enqueue");
}

#[test]
fn next_transaction_stops_at_first_foreign_tx_id() {
    let db = SqliteDb::open_in_memory().expect("open");
    let writer = DirectWriter::new(db.clone(), ChangeNotifier::new());
    let outbox = Outbox::new(db);

    outbox
        .enqueue_raw(r#"{"op":"DELETE","type":"customers","id":"x"}"#, Some(1))
        .expect("raw");
    // Allocated tx id 1 as well, but written after a foreign row.
    writer.put("customers", "y", json!({})).expect("put");
    writer.put("customers", "z", json!({})).expect("put");

    let head = outbox.next_transaction().expect("next");
    assert_eq!(ids(&head), vec!["x", "y"]);
    outbox.mark_complete(head.iter().map(|m| m.id.as_str())).expect("complete");
    assert_eq!(ids(&outbox.next_transaction().expect("next")), vec!["z"]);
}

#[test]
fn peek_returns_valid_prefix_before_malformed_row() {
    let outbox = Outbox::new(SqliteDb::open_in_memory().expect("open"));
    outbox
        .enqueue(NewMutation::put("customers", "1", json!({})))
        .expect("enqueue");
    let bad = outbox.enqueue_raw("{not json", None).expect("raw");
    outbox
        .enqueue(NewMutation::put("customers", "2", json!({})))
        .expect("enqueue");

    let first = outbox.peek_batch(10).expect("peek");
    assert_eq!(ids(&first), vec!["1"]);
    outbox.mark_complete(first.iter().map(|m| m.id.as_str())).expect("complete");

    let err = outbox.peek_batch(10).expect_err("malformed head");
    assert!(matches!(err, StorageError::Malformed { seq, .. } if seq == bad));
}

#[test]
fn failed_push_leaves_record_and_outbox_untouched() {
    let db = SqliteDb::open_in_memory().expect("open");
    let notifier = ChangeNotifier::new();
    let writer = DirectWriter::new(db.clone(), notifier.clone());
    let records = RecordStore::new(db.clone(), notifier);
    let outbox = Outbox::new(db);

    let pending = outbox
        .enqueue(NewMutation::put("customers", "8", json!({"name": "eight"})))
        .expect("enqueue");

    let written = writer
        .transaction(|batch| {
            let reused = NewMutation {
                id: pending.id.clone(),
                ..NewMutation::put("customers", "9", json!({"name": "nine"}))
            };
            let err = batch.push(reused).expect_err("duplicate id");
            assert!(matches!(err, StorageError::Duplicate(_)));
            batch.put("customers", "10", json!({"name": "ten"}))?;
            Ok(())
        })
        .expect("transaction");

    assert_eq!(written.len(), 1);
    assert_eq!(records.get("customers", "9").expect("get"), None);
    assert!(records.get("customers", "10").expect("get").is_some());
    let targets: Vec<String> = outbox
        .peek_batch(10)
        .expect("peek")
        .into_iter()
        .map(|m| m.target_id)
        .collect();
    assert_eq!(targets, vec!["8", "10"]);
}
