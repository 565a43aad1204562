#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use outbox::{
    mutation::UploadBatch,
    notify::ChangeNotifier,
    persist::{outbox::Outbox, sqlite::SqliteDb},
    upload::{Transport, TransportError, UploadMode, uploader::Uploader},
    writer::DirectWriter,
};

#[derive(Default)]
struct Script {
    outcomes: VecDeque<Result<(), TransportError>>,
    attempts: Vec<UploadBatch>,
}

/// Transport that records every attempt and answers from a script, then `Ok`.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push(&self, outcome: Result<(), TransportError>) {
        self.script.lock().expect("lock").outcomes.push_back(outcome);
    }

    pub fn attempts(&self) -> Vec<UploadBatch> {
        self.script.lock().expect("lock").attempts.clone()
    }

    pub fn uploaded_ids(&self) -> Vec<String> {
        self.attempts()
            .into_iter()
            .flat_map(|b| b.batch.into_iter().map(|e| e.id))
            .collect()
    }
}

impl Transport for ScriptedTransport {
    async fn upload(&self, batch: &UploadBatch) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().expect("lock");
        script.attempts.push(batch.clone());
        script.outcomes.pop_front().unwrap_or(Ok(()))
    }
}

pub fn network_down() -> TransportError {
    TransportError::Network {
        reason: "request timed out".to_string(),
    }
}

pub fn rejected(status: u16) -> TransportError {
    TransportError::Rejected {
        status,
        body: "nope".to_string(),
    }
}

pub struct Fixture {
    pub db: SqliteDb,
    pub notifier: ChangeNotifier,
    pub writer: DirectWriter,
    pub outbox: Outbox,
    pub transport: ScriptedTransport,
    pub uploader: Arc<Uploader<ScriptedTransport>>,
}

pub fn fixture(mode: UploadMode, max_rejections: u32) -> Fixture {
    fixture_with(ScriptedTransport::new(), mode, max_rejections)
}

pub fn fixture_with(
    transport: ScriptedTransport,
    mode: UploadMode,
    max_rejections: u32,
) -> Fixture {
    let db = SqliteDb::open_in_memory().expect("open sqlite");
    let notifier = ChangeNotifier::new();
    let outbox = Outbox::new(db.clone());
    let uploader = Arc::new(Uploader::new(
        outbox.clone(),
        transport.clone(),
        notifier.clone(),
        mode,
        max_rejections,
    ));
    Fixture {
        writer: DirectWriter::new(db.clone(), notifier.clone()),
        db,
        notifier,
        outbox,
        transport,
        uploader,
    }
}
