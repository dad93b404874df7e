//! Survey - interview execution CLI
//!
//! The `survey` command runs job definition files against language models.
//!
//! ## Commands
//!
//! - `run`: Execute a job and write its results as JSON
//! - `validate`: Check a job definition without running it
//! - `cache`: Export, import, or inspect an on-disk response cache

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use survey_cache::{FsCacheStore, ResponseCache};
use survey_core::{JobDefinition, QuestionStatus, Results, RunEnvironment, RunOptions};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "survey")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run survey interviews against language models", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "SURVEY_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a job definition
    Run(RunArgs),

    /// Validate a job definition without calling any model
    Validate {
        /// Path to the job definition (JSON)
        definition: PathBuf,
    },

    /// Manage the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the job definition (JSON)
    definition: PathBuf,

    /// Response cache directory
    #[arg(long, env = "SURVEY_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Run without any response cache
    #[arg(long, conflicts_with = "cache_dir")]
    no_cache: bool,

    /// Write results here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Override the definition's concurrency limit
    #[arg(long, env = "SURVEY_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Override the number of iterations per interview
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Stop the job at the first failed question
    #[arg(long)]
    stop_on_exception: bool,

    /// Recompute every model call even when cached
    #[arg(long)]
    bypass_cache: bool,

    /// Use simulated answers and make no model calls
    #[arg(long)]
    dry_run: bool,

    /// Cancel the job after this many milliseconds
    #[arg(long)]
    job_timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Write every cache entry as JSON lines
    Export {
        #[arg(long, env = "SURVEY_CACHE_DIR")]
        cache_dir: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Add entries from a JSON lines file; existing entries are kept
    Import {
        #[arg(long, env = "SURVEY_CACHE_DIR")]
        cache_dir: PathBuf,

        /// JSON lines file produced by `cache export`
        input: PathBuf,
    },

    /// Show how many entries the cache holds
    Stats {
        #[arg(long, env = "SURVEY_CACHE_DIR")]
        cache_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    survey_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(&args).await.map(|_| ()),
        Commands::Validate { definition } => cmd_validate(&definition),
        Commands::Cache { action } => match action {
            CacheAction::Export { cache_dir, output } => {
                cmd_cache_export(&cache_dir, output.as_deref()).map(|_| ())
            }
            CacheAction::Import { cache_dir, input } => {
                cmd_cache_import(&cache_dir, &input).map(|_| ())
            }
            CacheAction::Stats { cache_dir } => cmd_cache_stats(&cache_dir),
        },
    }
}

fn open_cache(dir: &Path) -> Result<ResponseCache> {
    let store = FsCacheStore::new(dir)
        .with_context(|| format!("Failed to open cache directory {:?}", dir))?;
    Ok(ResponseCache::new(Arc::new(store)))
}

fn apply_overrides(options: &mut RunOptions, args: &RunArgs) {
    if let Some(n) = args.max_concurrency {
        options.max_concurrency = n;
    }
    if let Some(n) = args.iterations {
        options.n = n;
    }
    if let Some(ms) = args.job_timeout_ms {
        options.job_timeout_ms = Some(ms);
    }
    options.stop_on_exception |= args.stop_on_exception;
    options.bypass_cache |= args.bypass_cache;
    options.dry_run |= args.dry_run;
}

async fn cmd_run(args: &RunArgs) -> Result<Results> {
    let definition = JobDefinition::from_path(&args.definition)?;
    let (job, mut options) = definition
        .into_job()
        .with_context(|| format!("Invalid job definition {:?}", args.definition))?;
    apply_overrides(&mut options, args);

    let mut env = RunEnvironment::new();
    match (&args.cache_dir, args.no_cache) {
        (Some(dir), false) => env = env.with_cache(Arc::new(open_cache(dir)?)),
        (None, false) => env = env.with_cache(Arc::new(ResponseCache::in_memory())),
        (_, true) => {}
    }

    let stop = env.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping job");
            stop.stop();
        }
    });

    let results = job.run(env, options).await.context("Job failed to run")?;
    ctrl_c.abort();

    let json = results.to_json_pretty()?;
    match &args.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {:?}", path))?,
        None => println!("{json}"),
    }
    print_summary(&results);
    Ok(results)
}

fn print_summary(results: &Results) {
    let count = |status: QuestionStatus| -> usize { results.iter().map(|i| i.count(status)).sum() };
    info!(
        job_id = %results.job_id,
        interviews = results.len(),
        succeeded = count(QuestionStatus::Succeeded),
        failed = count(QuestionStatus::Failed),
        skipped = count(QuestionStatus::Skipped),
        aborted = count(QuestionStatus::Aborted),
        new_tokens = results.usage.new.total(),
        cached_tokens = results.usage.cached.total(),
        cost_usd = results.cost_usd,
        cancelled = results.cancelled,
        "job complete"
    );
}

fn cmd_validate(path: &Path) -> Result<()> {
    let definition = JobDefinition::from_path(path)?;
    let (job, options) = definition
        .into_job()
        .with_context(|| format!("Invalid job definition {:?}", path))?;
    options.validate()?;
    println!(
        "{:?}: {} questions, {} interviews per iteration",
        path,
        job.survey().len(),
        job.interviews(1).len()
    );
    Ok(())
}

fn cmd_cache_export(dir: &Path, output: Option<&Path>) -> Result<usize> {
    let cache = open_cache(dir)?;
    let written = match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
            let mut writer = BufWriter::new(file);
            let n = cache.export_jsonl(&mut writer)?;
            writer.flush()?;
            n
        }
        None => cache.export_jsonl(std::io::stdout().lock())?,
    };
    info!(entries = written, "cache exported");
    Ok(written)
}

fn cmd_cache_import(dir: &Path, input: &Path) -> Result<usize> {
    let cache = open_cache(dir)?;
    let file = File::open(input).with_context(|| format!("Failed to open {:?}", input))?;
    let added = cache.import_jsonl(BufReader::new(file))?;
    info!(entries = added, "cache imported");
    Ok(added)
}

fn cmd_cache_stats(dir: &Path) -> Result<()> {
    let cache = open_cache(dir)?;
    println!("{} entries in {:?}", cache.len()?, dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"{
        "survey": {
            "questions": [
                {"type": "yes_no", "name": "tea", "text": "Do you drink tea?"},
                {"type": "numerical", "name": "cups", "text": "How many cups a day?", "min": 0}
            ],
            "rules": [{"source": "tea", "expression": "tea == 'No'", "target": "end_of_survey"}]
        },
        "agents": [{"name": "alice", "traits": {"drinks": true}}, {"name": "bob", "traits": {"drinks": false}}],
        "models": [{
            "type": "scripted",
            "id": "fixture",
            "responses": [
                {"contains": ["\"drinks\":true", "Do you drink tea?"], "output": "Yes"},
                {"contains": ["\"drinks\":false", "Do you drink tea?"], "output": "No"},
                {"contains": ["How many cups"], "output": "3"}
            ]
        }]
    }"#;

    fn run_args(definition: PathBuf, cache_dir: PathBuf, output: PathBuf) -> RunArgs {
        RunArgs {
            definition,
            cache_dir: Some(cache_dir),
            no_cache: false,
            output: Some(output),
            max_concurrency: None,
            iterations: None,
            stop_on_exception: false,
            bypass_cache: false,
            dry_run: false,
            job_timeout_ms: None,
        }
    }

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "survey",
            "--json",
            "run",
            "job.json",
            "--cache-dir",
            "/tmp/cache",
            "--max-concurrency",
            "4",
            "-n",
            "3",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.json);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.definition, PathBuf::from("job.json"));
        assert_eq!(args.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(args.max_concurrency, Some(4));
        assert_eq!(args.iterations, Some(3));
        assert!(args.dry_run);
    }

    #[test]
    fn test_no_cache_conflicts_with_cache_dir() {
        let parsed = Cli::try_parse_from([
            "survey",
            "run",
            "job.json",
            "--cache-dir",
            "/tmp/cache",
            "--no-cache",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_cache_subcommands() {
        let cli = Cli::try_parse_from(["survey", "cache", "import", "--cache-dir", "c", "in.jsonl"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                action: CacheAction::Import { .. }
            }
        ));
    }

    #[test]
    fn test_overrides_only_touch_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = run_args(dir.path().join("d.json"), dir.path().join("c"), dir.path().join("o.json"));
        args.max_concurrency = Some(2);
        args.bypass_cache = true;
        let mut options = RunOptions {
            n: 5,
            ..RunOptions::default()
        };
        apply_overrides(&mut options, &args);
        assert_eq!(options.max_concurrency, 2);
        assert_eq!(options.n, 5);
        assert!(options.bypass_cache);
        assert!(!options.dry_run);
    }

    #[tokio::test]
    async fn test_run_twice_reuses_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let definition = dir.path().join("job.json");
        std::fs::write(&definition, DEFINITION).unwrap();
        let cache_dir = dir.path().join("cache");
        let output = dir.path().join("results.json");

        let first = cmd_run(&run_args(definition.clone(), cache_dir.clone(), output.clone()))
            .await
            .unwrap();
        assert!(first.failures().is_empty());
        assert_eq!(first.interviews[0].answer("cups"), Some(&serde_json::json!(3)));
        assert_eq!(first.interviews[1].status("cups"), Some(QuestionStatus::Skipped));
        assert!(!first.usage.new.is_zero());

        let second = cmd_run(&run_args(definition, cache_dir, output.clone()))
            .await
            .unwrap();
        assert!(second.usage.new.is_zero());
        assert_eq!(second.usage.cached, first.usage.new);

        let written: Results = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written.job_id, second.job_id);
    }

    #[tokio::test]
    async fn test_cache_export_import_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let definition = dir.path().join("job.json");
        std::fs::write(&definition, DEFINITION).unwrap();
        let source = dir.path().join("source");
        cmd_run(&run_args(definition, source.clone(), dir.path().join("out.json")))
            .await
            .unwrap();

        let dump = dir.path().join("dump.jsonl");
        let exported = cmd_cache_export(&source, Some(dump.as_path())).unwrap();
        assert_eq!(exported, 3);

        let target = dir.path().join("target");
        assert_eq!(cmd_cache_import(&target, &dump).unwrap(), 3);
        assert_eq!(cmd_cache_import(&target, &dump).unwrap(), 0);
        assert_eq!(open_cache(&target).unwrap().len().unwrap(), 3);
    }

    #[test]
    fn test_validate_reports_bad_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"survey": {"questions": []}}"#).unwrap();
        let err = cmd_validate(&path).unwrap_err();
        assert!(format!("{err:#}").contains("no questions"));
    }
}
