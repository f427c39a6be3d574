use anyhow::Context;
use asha_sync::model::{RecordId, RecordKind};
use asha_sync::resolve::ResolutionChoice;
use asha_sync::sync::SyncStatus;
use asha_sync::{config, exchange_with, observability, open_engine, reset, run, serve};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;

#[derive(Parser)]
#[command(
	name = "asha-sync",
	about = "asha-sync - offline-first sync core for the ASHA companion app"
)]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Choice {
	Local,
	Remote,
	Merged,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the background sync loop until Ctrl-C (default)
	Run,
	/// Run one sync cycle now
	Sync,
	/// Show pending counts, conflicts and the last sync outcome
	Status,
	/// List open conflicts as JSON
	Conflicts,
	/// Resolve an open conflict
	Resolve {
		case: u64,
		#[arg(value_enum)]
		choice: Choice,
		/// JSON value for a merged resolution
		#[arg(long)]
		value: Option<String>,
	},
	/// Write one field locally, e.g. `edit patient P1 phone '"98450"'`
	Edit {
		kind: RecordKind,
		id: String,
		field: String,
		/// JSON value
		value: String,
	},
	/// Exchange changes with a paired peer
	Exchange {
		peer: String,
		/// host:port the peer accepts sessions on
		addr: String,
	},
	/// Serve an authority over HTTP (pull/push, /health, /metrics)
	Serve,
	/// Delete local state; the next start resyncs from the authority
	Reset,
}

fn format_millis(ms: Option<u64>) -> String {
	ms.and_then(|m| chrono::DateTime::from_timestamp_millis(m as i64))
		.map(|t| t.to_rfc3339())
		.unwrap_or_else(|| "never".to_string())
}

fn print_status(status: &SyncStatus) {
	println!("phase:            {:?}", status.phase);
	println!(
		"pending:          {} pending, {} failed, {} conflicted, {} permanent",
		status.pending.pending,
		status.pending.failed,
		status.pending.conflicted,
		status.pending.permanent_failures
	);
	println!("open conflicts:   {}", status.open_conflicts);
	println!("watermark:        {}", status.watermark);
	println!("last success:     {}", format_millis(status.last_success_at));
	if let Some(err) = &status.last_error {
		println!("last error:       {}", err);
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let settings = match config::load() {
		Ok(s) => s,
		Err(e) => {
			eprintln!("failed to load config, using defaults: {}", e);
			config::Settings::default()
		}
	};
	let obs = observability::init_observability(&settings.log_level)?;
	let metrics = obs.metrics;

	match cli.command.unwrap_or(Commands::Run) {
		Commands::Run => run(&settings, metrics).await?,
		Commands::Serve => serve(&settings, metrics).await?,
		Commands::Reset => {
			reset(&settings).await?;
			println!("Local state removed from {}.", settings.data_dir.display());
		}
		Commands::Sync => {
			let engine = open_engine(&settings, metrics).await?;
			let report = engine.trigger_sync_now().await?;
			println!("{}", serde_json::to_string_pretty(&report)?);
			print_status(&engine.status());
		}
		Commands::Status => {
			let engine = open_engine(&settings, metrics).await?;
			print_status(&engine.status());
			for problem in engine.attention() {
				println!("needs attention:  {}", problem);
			}
		}
		Commands::Conflicts => {
			let engine = open_engine(&settings, metrics).await?;
			println!("{}", serde_json::to_string_pretty(&engine.list_conflicts())?);
		}
		Commands::Resolve { case, choice, value } => {
			let choice = match choice {
				Choice::Local => ResolutionChoice::Local,
				Choice::Remote => ResolutionChoice::Remote,
				Choice::Merged => {
					let raw = value.context("--value is required for a merged resolution")?;
					let value = serde_json::from_str(&raw).context("--value is not valid JSON")?;
					ResolutionChoice::Merged(value)
				}
			};
			let engine = open_engine(&settings, metrics).await?;
			let closed = engine.resolve_conflict(case, choice).await?;
			println!("Conflict {} resolved: {:?}", closed.id, closed.resolution_state);
		}
		Commands::Edit { kind, id, field, value } => {
			let value: serde_json::Value =
				serde_json::from_str(&value).context("value is not valid JSON")?;
			let engine = open_engine(&settings, metrics).await?;
			let mut fields = BTreeMap::new();
			fields.insert(field, value);
			let version = engine.edit(&RecordId::new(id), kind, fields, None).await?;
			println!("Saved locally at version {}.", version);
		}
		Commands::Exchange { peer, addr } => {
			let engine = open_engine(&settings, metrics).await?;
			let report = exchange_with(&settings, engine, &peer, &addr).await?;
			println!("{}", serde_json::to_string_pretty(&report)?);
		}
	}
	Ok(())
}
