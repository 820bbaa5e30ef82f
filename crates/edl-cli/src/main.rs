use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use edl_core::{CandidateExtract, SourceRecord};
use edl_sync::{ByAddressMatcher, LinkConfig, LinkRequest, MatchingConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "edl-cli")]
#[command(about = "Link inspected establishments to business directory listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Phone pass then address pass over a window of the source table.
    Link(LinkArgs),
    /// Create the match tables.
    InitDb,
    /// Print the address-pass score for one name/address pair.
    Score(ScoreArgs),
}

#[derive(Debug, Default, Args)]
struct LinkArgs {
    /// Records to pull per pass; all remaining records when omitted.
    #[arg(short = 'n', long)]
    n_pull: Option<u64>,
    #[arg(short, long, default_value_t = 0)]
    offset: u64,
    #[arg(short, long)]
    report_interval: Option<usize>,
    #[arg(short, long)]
    search_limit: Option<u32>,
    #[arg(short = 'c', long)]
    create_tables: bool,
    /// Read sources from a JSON fixture instead of Postgres.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ScoreArgs {
    source_name: String,
    source_address: String,
    candidate_name: String,
    candidate_address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("edl=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = LinkConfig::from_env();

    match cli.command.unwrap_or_else(|| Commands::Link(LinkArgs::default())) {
        Commands::Link(args) => {
            if let Some(interval) = args.report_interval {
                config.report_interval = interval.max(1);
            }
            if let Some(limit) = args.search_limit {
                config.search_limit = limit;
            }
            let request = LinkRequest {
                n_pull: args.n_pull,
                offset: args.offset,
                create_tables: args.create_tables,
            };
            let summary = edl_sync::run_link(config, request, args.fixture).await?;
            println!(
                "link complete: run_id={} phone={}/{} address={}/{} reports={}",
                summary.run_id,
                summary.phone.matched,
                summary.phone.pulled,
                summary.address.matched,
                summary.address.pulled,
                summary.reports_dir
            );
        }
        Commands::InitDb => {
            edl_sync::init_db(&config).await?;
            info!("database initialized");
        }
        Commands::Score(args) => {
            let matching = MatchingConfig::from_workspace_root(&config.workspace_root)?;
            let matcher = ByAddressMatcher::new(matching);
            let source = SourceRecord::new(
                "cli",
                Some(args.source_name.as_str()),
                Some(args.source_address.as_str()),
                None,
                None,
            );
            let candidate = CandidateExtract {
                directory_id: "cli".to_string(),
                name: Some(args.candidate_name),
                address: Some(args.candidate_address),
                ..Default::default()
            };
            let scored = matcher.score(&source, &candidate);
            println!(
                "address={:.4} name={:.4} score={:.4}",
                scored.address_similarity, scored.name_similarity, scored.score
            );
        }
    }

    Ok(())
}
