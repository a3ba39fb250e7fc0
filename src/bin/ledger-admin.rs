use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use consent_ledger::audit::AuditTrail;
use consent_ledger::config::CoreConfig;
use consent_ledger::domain::BuyerId;
use consent_ledger::infra::{LedgerStorage, SqliteStorage, SystemClock};
use consent_ledger::metrics::MetricsRegistry;
use consent_ledger::telemetry::{init_tracing, TelemetryConfig};
use consent_ledger::trust::TrustEngine;

fn print_help() {
    eprintln!(
        "\
ledger-admin

USAGE:
  ledger-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  verify-chain                    Recompute audit hashes and report the first break
  rebuild-trust                   Rebuild every trust profile from the audit log
  show-trust                      Print a buyer's current trust profile
  export-audit                    Export audit entries to JSON/NDJSON

COMMON OPTIONS:
  --database-url <sqlite_url>     (defaults to env CONSENT_DATABASE_URL)

verify-chain OPTIONS:
  --from <n>                      (default: 1)
  --to <n>                        (default: head)

show-trust OPTIONS:
  --buyer-id <id>                 (required)

export-audit OPTIONS:
  --from <n>                      (default: 1)
  --to <n>                        (default: head)
  --buyer-id <id>                 (optional) Only entries attributable to this buyer
  --output <path>                 (optional) Output file path (default: stdout)
  --format <json|ndjson>          (default: ndjson)
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("CONSENT_DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("CONSENT_DATABASE_URL is required (or pass --database-url)"))
}

fn value_for(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

async fn open_storage(database_url: Option<String>) -> anyhow::Result<Arc<SqliteStorage>> {
    let database_url = require_database_url(database_url)?;
    let storage = SqliteStorage::connect(&database_url).await?;
    storage.initialize().await?;
    Ok(Arc::new(storage))
}

async fn open_trail(storage: Arc<SqliteStorage>) -> anyhow::Result<Arc<AuditTrail>> {
    let trail = AuditTrail::open(
        storage,
        Arc::new(SystemClock),
        Arc::new(MetricsRegistry::new()),
    )
    .await?;
    Ok(Arc::new(trail))
}

async fn open_trust(storage: Arc<SqliteStorage>) -> anyhow::Result<TrustEngine> {
    let config = CoreConfig::from_env()?;
    let audit = open_trail(storage.clone()).await?;
    Ok(TrustEngine::new(
        storage,
        audit,
        config.scoring,
        Arc::new(MetricsRegistry::new()),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&TelemetryConfig::from_env())?;

    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    match command.as_str() {
        "migrate" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value_for(&mut args, &arg)?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let database_url = require_database_url(database_url)?;
            let storage = SqliteStorage::connect(&database_url).await?;
            consent_ledger::migrations::run_sqlite(storage.pool()).await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "verify-chain" => {
            let mut database_url: Option<String> = None;
            let mut from_seq: u64 = 1;
            let mut to_seq: Option<u64> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value_for(&mut args, &arg)?),
                    "--from" => from_seq = value_for(&mut args, &arg)?.parse()?,
                    "--to" => to_seq = Some(value_for(&mut args, &arg)?.parse()?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let trail = open_trail(open_storage(database_url).await?).await?;
            let result = trail
                .verify_chain(from_seq, to_seq.unwrap_or(u64::MAX))
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);

            if !result.intact {
                anyhow::bail!(
                    "audit chain broken at sequence {}",
                    result.first_broken.unwrap_or_default()
                );
            }
            eprintln!("ok: {} entries verified", result.entries_checked);
            Ok(())
        }
        "rebuild-trust" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value_for(&mut args, &arg)?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let engine = open_trust(open_storage(database_url).await?).await?;
            let profiles = engine.rebuild_from_audit().await?;
            for profile in &profiles {
                println!(
                    "{}\tscore={}\ttier={}\tas_of={}",
                    profile.buyer_id, profile.score, profile.tier, profile.as_of_sequence
                );
            }
            eprintln!("ok: rebuilt {} trust profiles", profiles.len());
            Ok(())
        }
        "show-trust" => {
            let mut database_url: Option<String> = None;
            let mut buyer_id: Option<BuyerId> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value_for(&mut args, &arg)?),
                    "--buyer-id" => buyer_id = Some(BuyerId::new(value_for(&mut args, &arg)?)),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let buyer_id = buyer_id.ok_or_else(|| anyhow::anyhow!("--buyer-id is required"))?;
            let engine = open_trust(open_storage(database_url).await?).await?;
            let profile = engine.recompute(&buyer_id).await?;
            println!("{}", serde_json::to_string_pretty(&*profile)?);
            Ok(())
        }
        "export-audit" => {
            let mut database_url: Option<String> = None;
            let mut from_seq: u64 = 1;
            let mut to_seq: Option<u64> = None;
            let mut buyer_id: Option<BuyerId> = None;
            let mut output_path: Option<String> = None;
            let mut format = "ndjson".to_string();

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value_for(&mut args, &arg)?),
                    "--from" => from_seq = value_for(&mut args, &arg)?.parse()?,
                    "--to" => to_seq = Some(value_for(&mut args, &arg)?.parse()?),
                    "--buyer-id" => buyer_id = Some(BuyerId::new(value_for(&mut args, &arg)?)),
                    "--output" => output_path = Some(value_for(&mut args, &arg)?),
                    "--format" => format = value_for(&mut args, &arg)?,
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            if !matches!(format.as_str(), "json" | "ndjson") {
                anyhow::bail!("--format must be 'json' or 'ndjson'");
            }

            let storage = open_storage(database_url).await?;
            let head = storage.audit_head().await?;
            let to_seq = to_seq.unwrap_or(head.sequence).min(head.sequence);
            let mut entries = storage.read_audit_range(from_seq, to_seq).await?;
            if let Some(buyer_id) = &buyer_id {
                entries.retain(|e| e.buyer_id() == Some(buyer_id));
            }

            let mut output: Box<dyn Write> = match output_path {
                Some(path) => Box::new(std::fs::File::create(&path)?),
                None => Box::new(std::io::stdout()),
            };

            if format == "json" {
                serde_json::to_writer_pretty(&mut output, &entries)?;
                writeln!(output)?;
            } else {
                for entry in &entries {
                    serde_json::to_writer(&mut output, entry)?;
                    writeln!(output)?;
                }
            }

            eprintln!("ok: exported {} audit entries", entries.len());
            Ok(())
        }
        _ => {
            print_help();
            anyhow::bail!("unknown command: {command}");
        }
    }
}
