use std::env;
use std::path::PathBuf;
use std::time::Duration;

use kbroute_core::config::Config;
use kbroute_core::types::{MetadataFilter, QueryRequest, TierLabel};
use kbroute_embed::default_embedder;
use kbroute_orchestrator::{bootstrap, KnowledgeOrchestrator, Retrieval};
use kbroute_snapshot::SnapshotWriter;
use kbroute_text::chunking::{ChunkingConfig, DocumentChunker};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: kbroute <query|discover|health|snapshot> [args...]
  query \"<text>\" [--top N] [--deadline-ms N] [--tiers a,b] [--filter k=v]
  discover
  health
  snapshot <docs_dir> [--collection NAME]";

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }
    let cmd = args.remove(0);
    (cmd, args)
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(v) => v,
        None => {
            eprintln!("Error: {flag} requires a value");
            std::process::exit(1);
        }
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("Error: {flag} requires a number");
        std::process::exit(1);
    })
}

fn parse_query(args: &[String]) -> QueryRequest {
    let mut text = None;
    let mut request = QueryRequest::default();
    let mut filter = MetadataFilter::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--top" => {
                request = request.with_top_n(parse_number(flag_value(args, i, "--top"), "--top"));
                i += 1;
            }
            "--deadline-ms" => {
                let ms: u64 = parse_number(flag_value(args, i, "--deadline-ms"), "--deadline-ms");
                request = request.with_deadline(Duration::from_millis(ms));
                i += 1;
            }
            "--tiers" => {
                let tiers = flag_value(args, i, "--tiers")
                    .split(',')
                    .filter_map(|t| match t.parse::<TierLabel>() {
                        Ok(label) => Some(label),
                        Err(e) => {
                            tracing::warn!(error = %e, "ignoring tier");
                            None
                        }
                    })
                    .collect();
                request = request.with_tier_order(tiers);
                i += 1;
            }
            "--filter" => {
                let Some((k, v)) = flag_value(args, i, "--filter").split_once('=') else {
                    eprintln!("Error: --filter expects key=value");
                    std::process::exit(1);
                };
                filter = filter.with(k.trim(), v.trim());
                i += 1;
            }
            other if !other.starts_with("--") && text.is_none() => text = Some(other.to_string()),
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    let Some(text) = text else {
        eprintln!("Usage: kbroute query \"<text>\" [--top N] [--deadline-ms N] [--tiers a,b] [--filter k=v]");
        std::process::exit(1);
    };
    request.text = text;
    if !filter.is_empty() {
        request = request.with_filter(filter);
    }
    request
}

async fn discovered(config: &Config) -> anyhow::Result<KnowledgeOrchestrator> {
    let orchestrator = bootstrap::build(config).await?;
    let report = orchestrator.registry().discover().await;
    for (backend, reason) in &report.backends_failed {
        eprintln!("⚠️  backend {backend} unavailable: {reason}");
    }
    Ok(orchestrator)
}

fn print_retrieval(retrieval: &Retrieval) {
    match retrieval {
        Retrieval::Found(report) => {
            println!(
                "🔍 {} results from {} in {} ms{}",
                report.results.len(),
                report.tier,
                report.latency_ms,
                if report.partial { " (partial)" } else { "" }
            );
            for (i, r) in report.results.iter().enumerate() {
                println!(
                    "\n  {}. composite={:.4}  raw={:.4}  collection={}  id={}",
                    i + 1,
                    r.composite,
                    r.hit.score,
                    r.hit.collection.id,
                    r.hit.chunk.id
                );
                let snippet: String = r.hit.chunk.text.chars().take(200).collect();
                println!("     📝 {}", snippet.replace('\n', " "));
            }
        }
        Retrieval::NotFound(nf) => {
            let tiers: Vec<&str> = nf.tiers_attempted.iter().map(|t| t.as_str()).collect();
            println!("no knowledge found (tried: {}) in {} ms", tiers.join(", "), nf.latency_ms);
        }
    }
}

async fn write_snapshot(config: &Config, args: &[String]) -> anyhow::Result<()> {
    let settings = config.settings()?;
    let Some(snapshot) = &settings.snapshot else {
        anyhow::bail!("no [snapshot] section configured");
    };
    let mut docs_dir = None;
    let mut collection = "local".to_string();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--collection" => {
                collection = flag_value(args, i, "--collection").to_string();
                i += 1;
            }
            other if !other.starts_with("--") => docs_dir = Some(PathBuf::from(other)),
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }
    let Some(docs_dir) = docs_dir else {
        anyhow::bail!("usage: kbroute snapshot <docs_dir> [--collection NAME]");
    };
    let extensions = settings
        .keyword
        .as_ref()
        .map(|k| k.extensions.clone())
        .unwrap_or_else(|| vec!["txt".to_string(), "md".to_string()]);

    let chunks = DocumentChunker::new(ChunkingConfig::default()).chunk_directory(&docs_dir, &extensions)?;
    println!("Chunked {} into {} chunks", docs_dir.display(), chunks.len());
    let model_dir = settings.embedding.model_dir.as_ref().map(|d| config.resolve_path(d));
    let embedder = default_embedder(model_dir.as_deref(), settings.embedding.dimension, settings.embedding.fake)?;
    let path = config.resolve_path(&snapshot.path);
    let writer = SnapshotWriter::open(&path, &snapshot.table, embedder).await?.with_progress(true);
    let written = writer.write(&collection, &chunks).await?;
    println!("✅ Wrote {} chunks to {} ({})", written, path.display(), snapshot.table);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {}", e);
        e
    })?;
    let (cmd, args) = parse_args();
    match cmd.as_str() {
        "query" => {
            let request = parse_query(&args);
            let orchestrator = discovered(&config).await?;
            print_retrieval(&orchestrator.retrieve(request).await);
        }
        "discover" => {
            let orchestrator = discovered(&config).await?;
            let collections = orchestrator.registry().list(None);
            println!("📚 {} collections", collections.len());
            for c in collections {
                println!(
                    "  {:<40} group={:<7} weight={:.1}  dim={}  healthy={}",
                    c.id(),
                    c.group.as_str(),
                    c.weight(),
                    c.dimension.map_or_else(|| "?".to_string(), |d| d.to_string()),
                    c.health.is_healthy()
                );
            }
            println!("configured tiers: {:?}", orchestrator.chain().default_order());
        }
        "health" => {
            let orchestrator = discovered(&config).await?;
            println!("{}", serde_json::to_string_pretty(&orchestrator.health())?);
        }
        "snapshot" => write_snapshot(&config, &args).await?,
        _ => {
            eprintln!("Unknown command: {}\n{USAGE}", cmd);
            std::process::exit(1);
        }
    }
    Ok(())
}
