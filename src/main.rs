use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vanopticon_ratatoskr::{Engine, config, observability, run, store::PgWorkItemRepo};

#[derive(Parser)]
#[command(name = "ratatoskr", about = "Ratatoskr - work item mirror for remote issue trackers")]
struct Cli {
	/// Read settings from this file instead of the standard locations
	#[arg(long, global = true, env = "RTK_CONFIG")]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run scheduled syncs and the health endpoints (default)
	Run,
	/// Run a single sync and print its report
	Sync {
		/// Only records changed since the last sync, without comments
		#[arg(long)]
		shallow: bool,
	},
	/// Apply the bundled database schema
	Migrate,
	/// Post a comment on a work item
	Comment {
		/// Work item id
		id: i64,
		/// Comment text
		text: String,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let settings = match &cli.config {
		Some(path) => config::load_from(path).with_context(|| format!("failed to load {}", path.display()))?,
		None => match config::load() {
			Ok(s) => s,
			Err(e) => {
				eprintln!("failed to load config, using defaults and environment: {}", e);
				config::defaults_with_env()
			}
		},
	};

	let obs = observability::init_observability(settings.log_level)?;

	match cli.command.unwrap_or(Commands::Run) {
		Commands::Run => run(settings, obs.metrics).await?,
		Commands::Sync { shallow } => {
			let engine = Engine::connect(&settings, obs.metrics).await?;
			let orchestrator = &engine.orchestrator;
			let report = if shallow {
				orchestrator.run_shallow(&settings.scope).await
			} else {
				orchestrator.run_full(&settings.scope).await
			};
			match report {
				Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
				Err(e) => {
					eprintln!("{}", e.actionable());
					std::process::exit(1);
				}
			}
		}
		Commands::Migrate => {
			let repo = PgWorkItemRepo::connect(settings.database_url.as_str(), 1).await?;
			repo.ensure_schema().await?;
			println!("Schema applied.");
		}
		Commands::Comment { id, text } => {
			let engine = Engine::connect(&settings, obs.metrics).await?;
			if let Err(e) = engine.orchestrator.post_comment(id, &text).await {
				eprintln!("{}", e.actionable());
				std::process::exit(1);
			}
			println!("Comment posted on work item {}.", id);
		}
	}

	Ok(())
}
