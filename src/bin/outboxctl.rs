use std::path::PathBuf;

use clap::{Parser, Subcommand};
use outbox::{
    config::SyncConfig,
    logging,
    persist::outbox::Outbox,
    system::{System, SystemError},
    types::TxId,
};
use serde_json::{Value, json};

#[derive(Debug, Parser)]
#[command(name = "outboxctl")]
#[command(about = "Inspect and drain a local mutation outbox", version)]
struct Cli {
    /// Database file; overrides OUTBOX_DB_PATH.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Backend base URL; overrides OUTBOX_BACKEND_URL.
    #[arg(long)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Adds a customer with a random id.
    Add {
        #[arg(long, default_value = "customers")]
        table: String,
    },
    /// Creates or replaces a record from a JSON object.
    Put {
        table: String,
        id: String,
        #[arg(value_parser = parse_json_object)]
        data: Value,
    },
    /// Deletes a record.
    Delete { table: String, id: String },
    /// Lists the records of a table.
    List {
        #[arg(default_value = "customers")]
        table: String,
    },
    /// Shows pending outbox entries, oldest first.
    Pending {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Uploads everything pending.
    Flush,
    /// Appends a raw payload to the outbox without touching records.
    Raw {
        payload: String,
        #[arg(long)]
        tx_id: Option<TxId>,
    },
    /// Drops a pending entry that can never be uploaded.
    Discard { seq: u64 },
}

#[tokio::main]
async fn main() {
    logging::init_tracing_with_filter("warn");
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), SystemError> {
    let mut config = SyncConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(backend) = cli.backend {
        config.backend_url = backend;
    }
    let system = System::open(config)?;

    match cli.command {
        Command::Add { table } => {
            let id = (uuid::Uuid::new_v4().as_u128() % 1000).to_string();
            let mutation = system.put(&table, &id, json!({ "name": format!("Customer {id}") }))?;
            println!("seq={} id={} {} {}/{}", mutation.seq, mutation.id, mutation.op, table, id);
        }
        Command::Put { table, id, data } => {
            let mutation = system.put(&table, &id, data)?;
            println!("seq={} id={}", mutation.seq, mutation.id);
        }
        Command::Delete { table, id } => {
            let mutation = system.delete(&table, &id)?;
            println!("seq={} id={}", mutation.seq, mutation.id);
        }
        Command::List { table } => {
            for record in system.records().list(&table)? {
                println!("{}\t{}", record.id, record.data);
            }
        }
        Command::Pending { limit } => print_pending(system.outbox(), limit)?,
        Command::Flush => {
            let uploaded = system.flush().await?;
            println!("uploaded {uploaded}, pending {}", system.pending_count()?);
        }
        Command::Raw { payload, tx_id } => {
            let seq = system.outbox().enqueue_raw(&payload, tx_id)?;
            println!("seq={seq}");
        }
        Command::Discard { seq } => {
            let removed = system.outbox().discard(seq)?;
            println!("{}", if removed { "discarded" } else { "not found" });
        }
    }

    system.shutdown().await
}

fn parse_json_object(raw: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err("record data must be a JSON object".to_string()),
        Err(err) => Err(format!("invalid JSON: {err}")),
    }
}

fn print_pending(outbox: &Outbox, limit: usize) -> Result<(), SystemError> {
    for m in outbox.peek_batch(limit)? {
        let data = m.data.map(|d| d.to_string()).unwrap_or_default();
        let tx = m.tx_id.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{}\t{}\t{}\t{}\t{}\t{}\t{}", m.seq, tx, m.id, m.op, m.table, m.target_id, data);
    }
    Ok(())
}
