use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use jobmail::config::PipelineConfig;
use jobmail::pipeline::IngestionPipeline;
use jobmail::pipeline::classifier::{NullClassifier, StatisticalClassifier};
use jobmail::pipeline::extract::ProviderMessage;
use jobmail::pipeline::model::LinearTextModel;
use jobmail::pipeline::patterns::PatternHandle;
use jobmail::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let inputs: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if inputs.is_empty() {
        eprintln!("Usage: jobmail <FILE.eml | DIR>...");
        std::process::exit(2);
    }

    let config = PipelineConfig::from_env();
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    // ── Patterns ────────────────────────────────────────────────────────
    let patterns = PatternHandle::load(&config.patterns_path).unwrap_or_else(|e| {
        eprintln!(
            "Error: Failed to load patterns from {}: {}",
            config.patterns_path.display(),
            e
        );
        std::process::exit(1);
    });

    // ── Model ───────────────────────────────────────────────────────────
    let model: Arc<dyn StatisticalClassifier> = match LinearTextModel::load(&config.model_path) {
        Ok(model) => Arc::new(model),
        Err(e) => {
            tracing::warn!(
                path = %config.model_path.display(),
                error = %e,
                "Statistical classifier unavailable, continuing with rules only"
            );
            Arc::new(NullClassifier)
        }
    };

    // ── Database ────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    eprintln!("📬 jobmail v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Patterns: {}", config.patterns_path.display());
    eprintln!("   Database: {}", config.db_path.display());

    let messages = read_messages(&inputs).await?;
    let pipeline = IngestionPipeline::new(db, Arc::new(patterns), model, config);
    let outcome = pipeline.process_batch(messages).await;

    for record in &outcome.decisions {
        println!("{}", serde_json::to_string(record)?);
    }
    for failure in &outcome.failures {
        tracing::warn!(
            id = %failure.message_id,
            stage = %failure.stage,
            reason = %failure.reason,
            "Message not processed"
        );
    }
    eprintln!("   Counters: {}", serde_json::to_string(&outcome.counters)?);

    Ok(())
}

/// Expand files and directories into `.eml` messages, in path order.
async fn read_messages(inputs: &[PathBuf]) -> Result<Vec<ProviderMessage>, std::io::Error> {
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut entries = tokio::fs::read_dir(input).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("eml")) {
                    paths.push(path);
                }
            }
        } else {
            paths.push(input.clone());
        }
    }
    paths.sort();

    let mut messages = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(&path).await?;
        messages.push(ProviderMessage::Rfc822 {
            fallback_id: file_id(&path),
            bytes,
            received_at: modified_at(&path).await,
        });
    }
    Ok(messages)
}

fn file_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// File mtime stands in for the transport's delivery time.
async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
