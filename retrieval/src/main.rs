use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use notes_retrieval::{
    PipelineReport, ProviderKind, RetrievalConfig, RetrievalPipeline, ScoredSection,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Embed every top-level section of a markdown note and show, for each cached
/// section, its closest other section.
#[derive(Parser)]
#[command(name = "similar-notes")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Markdown document to split and embed
    document: PathBuf,

    /// Configuration file (TOML)
    #[arg(long, env = "SIMILAR_NOTES_CONFIG")]
    config: Option<PathBuf>,

    /// Embedding cache database, overriding the configuration
    #[arg(long)]
    database: Option<PathBuf>,

    /// Neighbors requested per section
    #[arg(short = 'k', long)]
    neighbors: Option<usize>,

    /// Embedding provider: openai or hash
    #[arg(long, value_parser = parse_provider)]
    provider: Option<ProviderKind>,

    /// Rank this document's sections against the one containing this line
    /// (1-based) instead of reporting the whole cache
    #[arg(long)]
    line: Option<usize>,

    /// Print whole section texts instead of their first lines
    #[arg(long)]
    full: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_provider(value: &str) -> Result<ProviderKind, String> {
    match value {
        "openai" => Ok(ProviderKind::OpenAI),
        "hash" => Ok(ProviderKind::Hash),
        other => Err(format!("unknown provider {other:?}, expected openai or hash")),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<RetrievalConfig> {
    let mut config = match &cli.config {
        Some(path) => RetrievalConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RetrievalConfig::default(),
    };

    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    if let Some(neighbors) = cli.neighbors {
        config.query.neighbors = neighbors;
    }
    if let Some(kind) = cli.provider {
        config.provider.kind = kind;
    }
    Ok(config)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

/// Byte offset of the start of `line` (1-based).
fn line_offset(document: &str, line: usize) -> usize {
    document
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum()
}

fn print_ranking(ranked: &[ScoredSection], full: bool) {
    for section in ranked {
        println!("{:.6}  {}", section.distance, section.title);
        if full {
            println!("{}", section.text);
        }
    }
}

fn print_report(report: &PipelineReport, full: bool) {
    for row in &report.rows {
        println!("-------------------");
        if full {
            println!("{}", row.text);
            println!("~~~");
            println!("{}", row.neighbor_text);
        } else {
            println!("{}", first_line(&row.text));
            println!("  ~ {}", first_line(&row.neighbor_text));
        }
        println!("  distance: {:.6}", row.result.distance);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let document = tokio::fs::read_to_string(&cli.document)
        .await
        .with_context(|| format!("reading {}", cli.document.display()))?;

    let pipeline = RetrievalPipeline::from_config(&config).await?;
    if let Some(line) = cli.line {
        let offset = line_offset(&document, line);
        let ranked = pipeline
            .similar_to(&document, offset, config.query.neighbors)
            .await?;
        print_ranking(&ranked, cli.full);
        return Ok(());
    }

    let report = pipeline.run(&document).await?;
    print_report(&report, cli.full);
    Ok(())
}
