use std::collections::{BTreeMap, HashSet};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier::journal::{self, Record};
use courier::storage::records;

#[derive(Parser)]
#[command(name = "courier-journal", version, about = "Courier journal tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record of every data file in replay order.
    Dump {
        dir: PathBuf,
        #[arg(long = "extension", default_value = "jrn")]
        extension: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Summarize files, live records and open transactions.
    Stats {
        dir: PathBuf,
        #[arg(long = "extension", default_value = "jrn")]
        extension: String,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Dump { dir, extension, limit } => dump(dir, &extension, limit),
        Commands::Stats { dir, extension } => stats(dir, &extension),
    }
}

fn dump(dir: PathBuf, extension: &str, limit: Option<usize>) -> Result<()> {
    let (scanned, free) =
        journal::scan(&dir, extension).with_context(|| format!("scan journal at {}", dir.display()))?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let limit = limit.unwrap_or(usize::MAX);
    for entry in scanned.iter().take(limit) {
        writeln!(
            out,
            "file={} seq={} offset={} {}",
            entry.file_id,
            entry.sequence,
            entry.offset,
            describe(&entry.record)
        )?;
    }
    writeln!(out, "records={} free_files={free}", scanned.len())?;
    out.flush()?;
    Ok(())
}

fn stats(dir: PathBuf, extension: &str) -> Result<()> {
    let (scanned, free) =
        journal::scan(&dir, extension).with_context(|| format!("scan journal at {}", dir.display()))?;

    let mut files = HashSet::new();
    let mut live: HashSet<u64> = HashSet::new();
    let mut by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut tx_adds: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    let mut tx_deletes: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    let mut prepared: HashSet<u64> = HashSet::new();

    for entry in &scanned {
        files.insert(entry.file_id);
        match &entry.record {
            Record::Add { id, user_type, .. } => {
                live.insert(*id);
                *by_type.entry(user_type_name(*user_type)).or_default() += 1;
            }
            Record::Update { .. } => {}
            Record::Delete { id } => {
                live.remove(id);
            }
            Record::AddTx { tx_id, id, user_type, .. } => {
                tx_adds.entry(*tx_id).or_default().push(*id);
                *by_type.entry(user_type_name(*user_type)).or_default() += 1;
            }
            Record::UpdateTx { .. } => {}
            Record::DeleteTx { tx_id, id } => tx_deletes.entry(*tx_id).or_default().push(*id),
            Record::Prepare { tx_id, .. } => {
                prepared.insert(*tx_id);
            }
            Record::Commit { tx_id, .. } => {
                prepared.remove(tx_id);
                live.extend(tx_adds.remove(tx_id).unwrap_or_default());
                for id in tx_deletes.remove(tx_id).unwrap_or_default() {
                    live.remove(&id);
                }
            }
            Record::Rollback { tx_id } => {
                prepared.remove(tx_id);
                tx_adds.remove(tx_id);
                tx_deletes.remove(tx_id);
            }
        }
    }
    let open = tx_adds
        .keys()
        .chain(tx_deletes.keys())
        .filter(|tx| !prepared.contains(tx))
        .collect::<HashSet<_>>()
        .len();

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    writeln!(out, "data_files: {}", files.len())?;
    writeln!(out, "free_files: {free}")?;
    writeln!(out, "records: {}", scanned.len())?;
    writeln!(out, "live_records: {}", live.len())?;
    writeln!(out, "prepared_transactions: {}", prepared.len())?;
    writeln!(out, "incomplete_transactions: {open}")?;
    for (name, count) in by_type {
        writeln!(out, "  {name}: {count}")?;
    }
    out.flush()?;
    Ok(())
}

fn describe(record: &Record) -> String {
    match record {
        Record::Add { id, user_type, data } => {
            format!("ADD id={id} type={} len={}", user_type_name(*user_type), data.len())
        }
        Record::Update { id, user_type, data } => {
            format!("UPDATE id={id} type={} len={}", user_type_name(*user_type), data.len())
        }
        Record::Delete { id } => format!("DELETE id={id}"),
        Record::AddTx {
            tx_id,
            id,
            user_type,
            data,
        } => format!(
            "ADD_TX tx={tx_id} id={id} type={} len={}",
            user_type_name(*user_type),
            data.len()
        ),
        Record::UpdateTx {
            tx_id,
            id,
            user_type,
            data,
        } => format!(
            "UPDATE_TX tx={tx_id} id={id} type={} len={}",
            user_type_name(*user_type),
            data.len()
        ),
        Record::DeleteTx { tx_id, id } => format!("DELETE_TX tx={tx_id} id={id}"),
        Record::Prepare {
            tx_id,
            record_count,
            data,
        } => format!("PREPARE tx={tx_id} records={record_count} xid_len={}", data.len()),
        Record::Commit { tx_id, record_count } => format!("COMMIT tx={tx_id} records={record_count}"),
        Record::Rollback { tx_id } => format!("ROLLBACK tx={tx_id}"),
    }
}

fn user_type_name(user_type: u8) -> &'static str {
    match user_type {
        records::BINDING_RECORD => "binding",
        records::ID_COUNTER_RECORD => "id_counter",
        records::ADD_MESSAGE => "message",
        records::ADD_REF => "ref",
        records::ACKNOWLEDGE_REF => "ack",
        records::UPDATE_DELIVERY_COUNT => "delivery_count",
        records::PAGE_TRANSACTION => "page_tx",
        records::DUPLICATE_ID => "duplicate_id",
        _ => "unknown",
    }
}
