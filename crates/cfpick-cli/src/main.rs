use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cfpick_adapters::SnapshotFileSource;
use cfpick_core::{Problem, RangeQuery, SelectionFlow, DEFAULT_SAMPLE_LIMIT};
use cfpick_query::QueryEngine;
use cfpick_storage::CatalogStore;
use cfpick_sync::{run_sync_once_from_env, SyncConfig, SyncJob};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cfpick")]
#[command(about = "Codeforces problem catalog: sync, serve and pick problems by topic and difficulty")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replace the local catalog with the current remote problemset.
    Sync {
        /// Load the payload from a saved file instead of the API.
        #[arg(long, value_name = "PATH")]
        from_snapshot: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Create the catalog tables if missing.
    Migrate {
        /// Drop and recreate every table, discarding the catalog.
        #[arg(long)]
        reset: bool,
    },
    /// Run the JSON API (and the sync schedule when enabled).
    Serve,
    /// Pick random problems for a topic within a difficulty window.
    Pick {
        #[arg(long)]
        tag: String,
        #[arg(long, default_value = "0")]
        min: String,
        #[arg(long)]
        max: Option<String>,
        #[arg(long, default_value_t = DEFAULT_SAMPLE_LIMIT)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show one problem and its tags.
    Show { contest_id: i64, index: String },
    /// List problems, optionally only those carrying a tag.
    List {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List every known tag.
    Tags,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        from_snapshot: None,
        json: false,
    }) {
        Commands::Sync { from_snapshot, json } => {
            let report = match from_snapshot {
                Some(path) => {
                    info!(path = %path.display(), "syncing from snapshot file");
                    let store = open_store(&SyncConfig::from_env()).await?;
                    SyncJob::new(store, Arc::new(SnapshotFileSource::new(path)))
                        .run_once()
                        .await
                        .context("catalog sync failed")?
                }
                None => run_sync_once_from_env().await.context("catalog sync failed")?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.summary());
            }
        }
        Commands::Migrate { reset } => {
            let config = SyncConfig::from_env();
            let store = open_store(&config).await?;
            if reset {
                store.reset_schema().await.context("resetting catalog schema")?;
            }
            println!(
                "catalog schema ready at {} ({} problems)",
                config.database_url,
                store.count_problems().await?
            );
        }
        Commands::Serve => cfpick_web::serve_from_env().await?,
        Commands::Pick {
            tag,
            min,
            max,
            limit,
            json,
        } => {
            let query = pick_query(&tag, &min, max.as_deref(), limit)?;
            let engine = open_engine().await?;
            let picked = engine.sample(&query).await?;
            if picked.is_empty() {
                eprintln!("no problems tagged `{}` in that difficulty window", query.tag);
            }
            print_problems(&picked, json)?;
        }
        Commands::Show { contest_id, index } => {
            let engine = open_engine().await?;
            let Some(problem) = engine.get_by_key(contest_id, &index).await? else {
                bail!("problem {contest_id}{index} is not in the catalog");
            };
            let tags = engine.store().tags_for_problem(problem.id).await?;
            let mut value = serde_json::to_value(&problem)?;
            value["url"] = problem.url().into();
            value["tags"] = tags.into_iter().map(|t| t.name).collect::<Vec<_>>().into();
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::List { tag, json } => {
            let engine = open_engine().await?;
            let problems = match tag {
                Some(tag) => engine.list_by_tag(&tag).await?,
                None => engine.list_all().await?,
            };
            print_problems(&problems, json)?;
        }
        Commands::Tags => {
            let engine = open_engine().await?;
            for tag in engine.list_tags().await? {
                println!("{}", tag.name);
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn open_store(config: &SyncConfig) -> Result<CatalogStore> {
    CatalogStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening catalog store {}", config.database_url))
}

async fn open_engine() -> Result<QueryEngine> {
    Ok(QueryEngine::new(open_store(&SyncConfig::from_env()).await?))
}

/// Runs the flags through the same dialogue a chat session would.
fn pick_query(tag: &str, min: &str, max: Option<&str>, limit: usize) -> Result<RangeQuery> {
    let mut flow = SelectionFlow::new().with_limit(limit);
    flow.choose_topic(tag)?;
    flow.choose_min(min)?;
    let query = match max {
        Some(max) => flow.choose_max(max)?,
        None => flow.finish_without_max()?,
    };
    Ok(query)
}

fn print_problems(problems: &[Problem], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(problems)?);
        return Ok(());
    }
    for problem in problems {
        let points = problem
            .points
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:>6}  {}  {}",
            problem.key().to_string(),
            points,
            problem.name,
            problem.url()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_flags_build_closed_and_open_windows() {
        let closed = pick_query("dp", "500", Some("1000"), 3).expect("closed");
        assert_eq!(closed, RangeQuery::new("dp", 500.0, Some(1000.0)).with_limit(3));

        let open = pick_query(" greedy ", "1200", None, 10).expect("open");
        assert_eq!(open, RangeQuery::new("greedy", 1200.0, None));
    }

    #[test]
    fn pick_flags_reject_bad_input() {
        assert!(pick_query("dp", "hard", None, 10).is_err());
        assert!(pick_query("dp", "1000", Some("500"), 10).is_err());
        assert!(pick_query("  ", "0", None, 10).is_err());
    }

    #[test]
    fn cli_parses_pick_and_show() {
        let cli = Cli::try_parse_from(["cfpick", "pick", "--tag", "dp", "--min", "800", "--max", "1200"])
            .expect("pick");
        assert!(matches!(
            cli.command,
            Some(Commands::Pick { ref tag, limit: DEFAULT_SAMPLE_LIMIT, .. }) if tag == "dp"
        ));

        let cli = Cli::try_parse_from(["cfpick", "show", "4", "A"]).expect("show");
        assert!(matches!(
            cli.command,
            Some(Commands::Show { contest_id: 4, ref index }) if index == "A"
        ));
    }
}
