//! Command-line surface over the pipeline library: `run`/`crawl-only`/`translate-only`
//! drive the orchestrator to completion, `status` and `glossary` inspect an existing
//! book directory without starting a pipeline.
//!
//! Grounded on `nacht-org-quelle`'s `quelle_cli::Cli`/`Commands` (a `clap::Parser` top
//! level with a `#[command(subcommand)]` enum, one variant per verb) and the teacher's
//! own `tokio::select!` race between a unit of work and `tokio::signal::ctrl_c()`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use noveldich::config::Config;
use noveldich::ebook::DefaultEbookAssembler;
use noveldich::events::PipelineEvent;
use noveldich::fetcher::{HttpFetcher, ReqwestFetcher};
use noveldich::glossary::GlossaryStore;
use noveldich::llm::{LlmClient, OpenAiCompatibleLlmClient};
use noveldich::models::{ChapterRange, ChapterStatus, GlossaryCategory, GlossaryEntry, MergeMode, PipelineMode};
use noveldich::orchestrator::{Orchestrator, PipelineDeps, RunRequest};
use noveldich::patterns::{HeuristicPatternAnalyzer, PatternAnalyzer};
use noveldich::progress_store;
use noveldich::style::StyleTemplate;

const EXIT_ALL_DONE: u8 = 0;
const EXIT_DONE_WITH_ERRORS: u8 = 2;
const EXIT_CANCELLED: u8 = 3;
const EXIT_FATAL: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "noveldich")]
#[command(about = "Crawls, translates, and publishes serialized web novels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Crawl and translate a book end to end
    Run(PipelineArgs),
    /// Crawl chapters only, skip translation
    CrawlOnly(PipelineArgs),
    /// Translate already-crawled chapters only
    TranslateOnly(PipelineArgs),
    /// Print a book's chapter/glossary status and exit
    Status {
        /// Directory the book's book.json lives in
        book_dir: PathBuf,
    },
    /// Inspect or edit a book's glossary
    Glossary {
        #[command(subcommand)]
        command: GlossaryCommands,
    },
}

#[derive(clap::Args, Debug)]
struct PipelineArgs {
    /// Directory to store book.json, glossary.csv, and chapter files in
    book_dir: PathBuf,
    /// Index page URL; required the first time a book is opened, ignored afterward
    #[arg(long)]
    source_url: Option<String>,
    /// TOML configuration file; defaults used for anything it omits
    #[arg(long)]
    config: Option<PathBuf>,
    /// TOML style template file; falls back to the default Chinese-to-Vietnamese style
    #[arg(long)]
    style: Option<PathBuf>,
    /// Overrides the configured worker count
    #[arg(long)]
    workers: Option<usize>,
    /// First chapter index to include (inclusive)
    #[arg(long)]
    range_start: Option<u32>,
    /// Last chapter index to include (inclusive)
    #[arg(long)]
    range_end: Option<u32>,
    /// Re-run chapters already in a terminal state instead of skipping them
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand, Debug)]
enum GlossaryCommands {
    /// List every glossary entry
    List {
        book_dir: PathBuf,
    },
    /// Add or update one glossary entry
    Add {
        book_dir: PathBuf,
        source_term: String,
        target_term: String,
        #[arg(long, default_value = "general")]
        category: String,
        #[arg(long)]
        notes: Option<String>,
        /// Overwrite an existing translation for this source term
        #[arg(long)]
        replace: bool,
    },
    /// Remove one glossary entry by its source term
    Remove {
        book_dir: PathBuf,
        source_term: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal error");
            EXIT_FATAL
        }
    };
    ExitCode::from(code)
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Commands::Run(args) => run_pipeline(args, PipelineMode::Full).await,
        Commands::CrawlOnly(args) => run_pipeline(args, PipelineMode::CrawlOnly).await,
        Commands::TranslateOnly(args) => run_pipeline(args, PipelineMode::TranslateOnly).await,
        Commands::Status { book_dir } => print_status(&book_dir).await,
        Commands::Glossary { command } => run_glossary_command(command).await,
    }
}

async fn run_pipeline(args: PipelineArgs, mode: PipelineMode) -> anyhow::Result<u8> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let style = match &args.style {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        }
        None => StyleTemplate::default(),
    };
    let workers = args.workers.unwrap_or(config.workers);
    let range = ChapterRange {
        start: args.range_start,
        end: args.range_end,
    };

    let deps = build_deps(&config);
    let orchestrator = Orchestrator::new(config, deps);

    let (tx, mut rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to serialize pipeline event"),
            }
        }
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt signal, cancelling pipeline");
            signal_cancel.cancel();
        }
    });

    let request = RunRequest {
        book_dir: args.book_dir,
        source_url: args.source_url,
        mode,
        range,
        workers,
        force: args.force,
        style,
        cancel,
        events: Some(tx),
    };

    let result = orchestrator.run(request).await?;
    let _ = printer.await;

    if result.cancelled {
        return Ok(EXIT_CANCELLED);
    }
    if result.all_done {
        return Ok(EXIT_ALL_DONE);
    }
    Ok(EXIT_DONE_WITH_ERRORS)
}

fn build_deps(config: &Config) -> PipelineDeps {
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(ReqwestFetcher::new());
    let pattern_analyzer: Arc<dyn PatternAnalyzer> = Arc::new(HeuristicPatternAnalyzer::new(
        fetcher.clone(),
        Duration::from_secs(config.crawl_timeout_s),
    ));
    let llm_crawl: Arc<dyn LlmClient> = Arc::new(OpenAiCompatibleLlmClient::new(&config.llm.resolve_crawl()));
    let llm_glossary: Arc<dyn LlmClient> = Arc::new(OpenAiCompatibleLlmClient::new(&config.llm.resolve_glossary()));
    let llm_translate: Arc<dyn LlmClient> = Arc::new(OpenAiCompatibleLlmClient::new(&config.llm.resolve_translate()));

    PipelineDeps {
        fetcher,
        pattern_analyzer,
        llm_crawl,
        llm_glossary,
        llm_translate,
        ebook_assembler: Arc::new(DefaultEbookAssembler),
    }
}

async fn print_status(book_dir: &std::path::Path) -> anyhow::Result<u8> {
    let progress = progress_store::load(book_dir)?;
    let glossary = GlossaryStore::load(book_dir)?;

    let mut pending = 0usize;
    let mut crawled = 0usize;
    let mut translated = 0usize;
    let mut errored = 0usize;
    for chapter in &progress.chapters {
        match chapter.status {
            ChapterStatus::Pending => pending += 1,
            ChapterStatus::Crawled => crawled += 1,
            ChapterStatus::Translated => translated += 1,
            ChapterStatus::Error => errored += 1,
        }
    }

    println!("source: {}", progress.source_url);
    if !progress.title.is_empty() {
        println!("title: {} ({})", progress.title, progress.title_translated);
    }
    println!(
        "chapters: {} pending, {} crawled, {} translated, {} error",
        pending, crawled, translated, errored
    );
    println!("glossary entries: {}", glossary.len().await);

    if errored > 0 {
        for chapter in progress.chapters.iter().filter(|c| c.status == ChapterStatus::Error) {
            println!(
                "  chapter {}: {}",
                chapter.index,
                chapter.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        return Ok(EXIT_DONE_WITH_ERRORS);
    }
    Ok(EXIT_ALL_DONE)
}

async fn run_glossary_command(command: GlossaryCommands) -> anyhow::Result<u8> {
    match command {
        GlossaryCommands::List { book_dir } => {
            let store = GlossaryStore::load(&book_dir)?;
            let snapshot = store.snapshot().await;
            for entry in snapshot.values() {
                println!("{}\t{}\t{:?}\t{}", entry.source_term, entry.target_term, entry.category, entry.notes.as_deref().unwrap_or(""));
            }
            Ok(EXIT_ALL_DONE)
        }
        GlossaryCommands::Add {
            book_dir,
            source_term,
            target_term,
            category,
            notes,
            replace,
        } => {
            let store = GlossaryStore::load(&book_dir)?;
            let entry = GlossaryEntry {
                source_term,
                target_term,
                category: parse_category(&category),
                notes,
            };
            let mode = if replace { MergeMode::Replace } else { MergeMode::Merge };
            store.add(vec![entry], mode).await?;
            Ok(EXIT_ALL_DONE)
        }
        GlossaryCommands::Remove { book_dir, source_term } => {
            let store = GlossaryStore::load(&book_dir)?;
            let removed = store.remove(&source_term).await?;
            if !removed {
                println!("no such entry: {}", source_term);
            }
            Ok(EXIT_ALL_DONE)
        }
    }
}

fn parse_category(s: &str) -> GlossaryCategory {
    match s {
        "character" => GlossaryCategory::Character,
        "realm" => GlossaryCategory::Realm,
        "technique" => GlossaryCategory::Technique,
        "location" => GlossaryCategory::Location,
        "item" => GlossaryCategory::Item,
        "organization" => GlossaryCategory::Organization,
        _ => GlossaryCategory::General,
    }
}
