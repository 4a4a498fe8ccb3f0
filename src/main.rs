//! CLI entry point for the embedding store.
//!
//! Opens the data directory named by the settings, runs one command and
//! exits. Every command that changes data is durable through the journal;
//! commands that write a lot checkpoint before exiting.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use embedstore::display::{THEME, catalog_table, neighbors_table, status_table};
use embedstore::exit_code::ExitCode;
use embedstore::{
    EmbedError, EntityTable, PrototypeKey, RecordId, SearchOptions, Settings, Substrate, logging,
};
use serde::Deserialize;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Embedding schema and index manager
#[derive(Parser)]
#[command(
    name = "embedstore",
    version = env!("CARGO_PKG_VERSION"),
    about = "Embedding schema and index manager",
    long_about = "Store 384-dimensional embeddings for five entity tables, maintain IVF indexes over them and keep topic prototypes for routed search.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Set up .embedstore directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(about = "Show record counts and index state per embedding column")]
    Status,

    #[command(
        about = "Load records from a JSON Lines file",
        after_help = "Each line: {\"id\": 7, \"vector\": [0.1, ...], \"prototype\": \"doc:d1|topic:tax\"}\n\"vector\" may be null; \"prototype\" is optional."
    )]
    Ingest {
        /// Target table (chunks, graph_nodes, knowledge_candidates, images, documents)
        table: EntityTable,

        /// JSON Lines input file
        file: PathBuf,
    },

    #[command(about = "Build or rebuild the IVF index of one embedding column")]
    RebuildIndex {
        table: EntityTable,

        /// Number of inverted lists (default: derived from the row count)
        #[arg(short, long)]
        lists: Option<usize>,
    },

    #[command(about = "Rebuild every stale index")]
    Maintain,

    #[command(about = "Inspect and manage topic prototypes")]
    Prototypes {
        #[command(subcommand)]
        action: PrototypeAction,
    },

    #[command(
        about = "Nearest-neighbor search over one embedding column",
        after_help = "Examples:\n  embedstore search chunks --vector-file q.json -k 5\n  embedstore search images --vector-file q.json --route 4\n  embedstore search documents --vector-file q.json --exact"
    )]
    Search {
        table: EntityTable,

        /// JSON file holding the query vector as an array of numbers
        #[arg(long)]
        vector_file: PathBuf,

        /// Number of results
        #[arg(short, default_value_t = 10)]
        k: usize,

        /// Scan every row instead of using the index
        #[arg(long)]
        exact: bool,

        /// Restrict to members of the N nearest prototypes
        #[arg(long)]
        route: Option<usize>,
    },

    #[command(about = "Write a snapshot and compact the journal")]
    Checkpoint,
}

#[derive(Subcommand)]
enum PrototypeAction {
    #[command(about = "Global topic catalog, largest first")]
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    #[command(about = "Show one prototype")]
    Show { key: String },

    #[command(about = "Delete a prototype and drop its memberships")]
    Delete { key: String },

    #[command(about = "Recompute the global topic rollups from per-document prototypes")]
    Rollup {
        /// Number of topics (default: prototypes.rollup_topic_limit)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    #[command(about = "Link catalog topics to the documents they cover")]
    Coverage {
        /// Number of catalog topics considered
        #[arg(short, long, default_value_t = 20)]
        topics: usize,

        /// Minimum cosine similarity (default: prototypes.coverage_min_similarity)
        #[arg(long)]
        min_similarity: Option<f32>,
    },
}

#[derive(Debug, Deserialize)]
struct IngestLine {
    id: u64,
    vector: Option<Vec<f32>>,
    #[serde(default)]
    prototype: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", THEME.error_with_icon(&format!("Configuration error: {e:#}")));
            std::process::exit(ExitCode::ConfigError.into());
        }
    };
    logging::init(&settings.logging, cli.verbose);

    let code = match run(&cli, settings) {
        Ok(code) => code,
        Err(e) => report(&e),
    };
    std::process::exit(code.into());
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(path)
            .map_err(|e| anyhow!("loading {}: {e}", path.display()))?,
        None => Settings::load().map_err(|e| anyhow!("{e}"))?,
    };
    settings.validate()?;
    Ok(settings)
}

fn report(error: &anyhow::Error) -> ExitCode {
    eprintln!("{}", THEME.error_with_icon(&format!("{error:#}")));
    match error.downcast_ref::<EmbedError>() {
        Some(e) => {
            for hint in e.recovery_suggestions() {
                eprintln!("  {}", THEME.apply(&THEME.dim, hint));
            }
            ExitCode::from_error(e)
        }
        None => ExitCode::GeneralError,
    }
}

fn run(cli: &Cli, settings: Settings) -> Result<ExitCode> {
    match &cli.command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(*force).map_err(|e| anyhow!("{e}"))?;
            println!(
                "{}",
                THEME.success_with_icon(&format!("Created configuration file at {}", path.display()))
            );
            Ok(ExitCode::Success)
        }

        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(ExitCode::Success)
        }

        Commands::Status => {
            let substrate = Substrate::open(settings)?;
            let rows: Vec<_> = EntityTable::ALL
                .into_iter()
                .map(|table| {
                    (
                        substrate.index_status(table),
                        substrate.store().record_count(table),
                        substrate.store().embedded_count(table),
                    )
                })
                .collect();
            if cli.json {
                let statuses: Vec<_> = rows.iter().map(|(s, _, _)| s).collect();
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                if let Some(dir) = substrate.data_dir() {
                    println!("Data directory: {}", THEME.apply(&THEME.path, dir.display()));
                }
                println!(
                    "Journal sequence: {}",
                    THEME.apply(&THEME.number, substrate.last_seq())
                );
                println!("{}", status_table(&rows));
            }
            Ok(ExitCode::Success)
        }

        Commands::Ingest { table, file } => {
            let substrate = Substrate::open(settings)?;
            let (records, assigned) = ingest(&substrate, *table, file)?;
            substrate.checkpoint()?;
            println!(
                "{}",
                THEME.success_with_icon(&format!(
                    "Ingested {records} records into {table} ({assigned} assigned to prototypes)"
                ))
            );
            Ok(ExitCode::Success)
        }

        Commands::RebuildIndex { table, lists } => {
            let substrate = Substrate::open(settings)?;
            let status = substrate.rebuild_index(*table, *lists)?;
            substrate.checkpoint()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "{}",
                    THEME.success_with_icon(&format!(
                        "{table} index ready: {} lists over {} rows",
                        status.lists.unwrap_or(0),
                        status.rows_indexed
                    ))
                );
            }
            Ok(ExitCode::Success)
        }

        Commands::Maintain => {
            let substrate = Substrate::open(settings)?;
            let results = substrate.run_maintenance();
            let mut failed = false;
            for (table, result) in &results {
                match result {
                    Ok(status) => println!(
                        "{}",
                        THEME.success_with_icon(&format!("{table}: {}", status.state))
                    ),
                    Err(e) => {
                        failed = true;
                        println!("{}", THEME.warning_with_icon(&format!("{table}: {e}")));
                    }
                }
            }
            if results.is_empty() {
                println!("No stale indexes");
            }
            substrate.checkpoint()?;
            Ok(if failed {
                ExitCode::GeneralError
            } else {
                ExitCode::Success
            })
        }

        Commands::Prototypes { action } => run_prototypes(cli, settings, action),

        Commands::Search {
            table,
            vector_file,
            k,
            exact,
            route,
        } => {
            let query = read_vector(vector_file)?;
            let substrate = Substrate::open(settings)?;
            let results = match route {
                Some(n) => substrate.route_then_search(*table, &query, *k, Some(*n), *exact)?,
                None => substrate.search(*table, &query, *k, SearchOptions { exact: *exact })?,
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("{}", neighbors_table(&results));
            }
            Ok(if results.is_empty() {
                ExitCode::NotFound
            } else {
                ExitCode::Success
            })
        }

        Commands::Checkpoint => {
            let substrate = Substrate::open(settings)?;
            let report = substrate.checkpoint()?;
            println!(
                "{}",
                THEME.success_with_icon(&format!(
                    "Checkpoint at seq {}; {} journal entries compacted",
                    report.seq, report.journal_entries_dropped
                ))
            );
            Ok(ExitCode::Success)
        }
    }
}

fn run_prototypes(cli: &Cli, settings: Settings, action: &PrototypeAction) -> Result<ExitCode> {
    let substrate = Substrate::open(settings)?;
    match action {
        PrototypeAction::List { limit } => {
            let entries = substrate.catalog(*limit);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("{}", catalog_table(&entries));
            }
            Ok(ExitCode::Success)
        }

        PrototypeAction::Show { key } => {
            let Some(prototype) = substrate.prototype(&PrototypeKey::from(key.as_str())) else {
                println!("{}", THEME.warning_with_icon(&format!("No prototype '{key}'")));
                return Ok(ExitCode::NotFound);
            };
            println!("{}", serde_json::to_string_pretty(&prototype)?);
            Ok(ExitCode::Success)
        }

        PrototypeAction::Delete { key } => {
            let removed = substrate.delete_prototype(&PrototypeKey::from(key.as_str()))?;
            println!(
                "{}",
                THEME.success_with_icon(&format!(
                    "Deleted '{key}' ({} members)",
                    removed.member_count()
                ))
            );
            Ok(ExitCode::Success)
        }

        PrototypeAction::Rollup { limit } => {
            let report = substrate.rebuild_topic_rollups(*limit)?;
            substrate.checkpoint()?;
            println!(
                "{}",
                THEME.success_with_icon(&format!(
                    "Rebuilt {} topic rollups, removed {}",
                    report.rollups.len(),
                    report.removed.len()
                ))
            );
            Ok(ExitCode::Success)
        }

        PrototypeAction::Coverage {
            topics,
            min_similarity,
        } => {
            let links = substrate.coverage_links(*topics, *min_similarity);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&links)?);
            } else {
                for link in &links {
                    println!(
                        "{}  documents/{}  {:.3}",
                        link.topic, link.document, link.similarity
                    );
                }
            }
            Ok(ExitCode::Success)
        }
    }
}

fn read_vector(path: &Path) -> Result<Vec<f32>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading query vector from {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} must hold a JSON array of numbers", path.display()))
}

/// Upserts every line of `path` into `table`. Returns the record count and
/// the number of prototype assignments.
fn ingest(substrate: &Substrate, table: EntityTable, path: &Path) -> Result<(usize, usize)> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut records = 0;
    let mut assigned = 0;

    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: IngestLine = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed record", path.display(), n + 1))?;
        let id = RecordId::new(parsed.id);
        substrate
            .upsert_record(table, id, parsed.vector)
            .with_context(|| format!("{}:{}", path.display(), n + 1))?;
        records += 1;

        if let Some(key) = parsed.prototype {
            substrate
                .assign_record(table, id, &PrototypeKey::from(key))
                .with_context(|| format!("{}:{}", path.display(), n + 1))?;
            assigned += 1;
        }
    }
    tracing::info!("[cli] ingested {records} records from {}", path.display());
    Ok((records, assigned))
}
