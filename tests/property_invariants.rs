mod common;

use std::collections::VecDeque;

use proptest::prelude::*;

use outbox::{
    types::{MutationId, OpKind},
    upload::UploadMode,
};
use serde_json::json;

use common::{fixture, network_down};

#[derive(Debug, Clone)]
enum Action {
    Put(u8),
    Delete(u8),
    Flush { fail: bool },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (0u8..16).prop_map(Action::Put),
        1 => (0u8..16).prop_map(Action::Delete),
        2 => any::<bool>().prop_map(|fail| Action::Flush { fail }),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn outbox_behaves_like_fifo_queue(
        actions in prop::collection::vec(action_strategy(), 1..60),
        batch in 1usize..5,
    ) {
        let rt = runtime();
        let fx = fixture(UploadMode::Batch(batch), 0);
        let mut model: VecDeque<(MutationId, OpKind, String)> = VecDeque::new();

        for action in actions {
            match action {
                Action::Put(id) => {
                    let m = fx.writer.put("items", &id.to_string(), json!({"v": id})).expect("put");
                    model.push_back((m.id, OpKind::Put, id.to_string()));
                }
                Action::Delete(id) => {
                    let m = fx.writer.delete("items", &id.to_string()).expect("delete");
                    model.push_back((m.id, OpKind::Delete, id.to_string()));
                }
                Action::Flush { fail: true } if !model.is_empty() => {
                    let before = fx.outbox.peek_batch(usize::MAX).expect("peek");
                    fx.transport.push(Err(network_down()));
                    prop_assert!(rt.block_on(fx.uploader.flush()).is_err());
                    prop_assert_eq!(fx.outbox.peek_batch(usize::MAX).expect("peek"), before);
                }
                Action::Flush { .. } => {
                    let attempts_before = fx.transport.attempts().len();
                    let n = rt.block_on(fx.uploader.flush()).expect("flush");
                    prop_assert_eq!(n, model.len().min(batch));
                    if n == 0 {
                        prop_assert_eq!(fx.transport.attempts().len(), attempts_before);
                        continue;
                    }
                    let sent = fx.transport.attempts().pop().expect("attempt");
                    for entry in sent.batch {
                        let (_, op, target) = model.pop_front().expect("model entry");
                        prop_assert_eq!(entry.op, op);
                        prop_assert_eq!(entry.id, target);
                    }
                }
            }

            let pending = fx.outbox.peek_batch(usize::MAX).expect("peek");
            prop_assert!(pending.windows(2).all(|w| w[0].seq < w[1].seq));
            let pending: Vec<(MutationId, OpKind, String)> = pending
                .into_iter()
                .map(|m| (m.id, m.op, m.target_id))
                .collect();
            prop_assert_eq!(pending, model.iter().cloned().collect::<Vec<_>>());
        }
    }

    #[test]
    fn transaction_mode_never_splits_transactions(
        groups in prop::collection::vec(1usize..5, 1..12),
    ) {
        let rt = runtime();
        let fx = fixture(UploadMode::Transaction, 0);

        for (g, size) in groups.iter().enumerate() {
            fx.writer
                .transaction(|tx| {
                    for i in 0..*size {
                        tx.put("items", &format!("{g}-{i}"), json!({"g": g}))?;
                    }
                    Ok(())
                })
                .expect("transaction");
        }

        for (g, size) in groups.iter().enumerate() {
            prop_assert_eq!(rt.block_on(fx.uploader.flush()).expect("flush"), *size);
            let sent = fx.transport.attempts().pop().expect("attempt");
            let prefix = format!("{g}-");
            prop_assert!(sent.batch.iter().all(|e| e.id.starts_with(&prefix)));
        }
        prop_assert_eq!(rt.block_on(fx.uploader.flush()).expect("flush"), 0);
    }
}
