//! `arbiter ask` — answer a question through the full pipeline.

use std::io::Write;
use std::sync::Arc;

use arbiter_agent::{AnswerStreamEvent, AskOptions};
use arbiter_config::AppConfig;
use arbiter_core::event::EventBus;

use crate::bootstrap;

pub async fn run(
    query: String,
    stream: bool,
    session: Option<String>,
    sources: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    config.validate()?;

    // Local providers run without a key; everything else needs one
    let local = matches!(config.default_provider.as_str(), "ollama" | "vllm");
    let no_key = config.api_key.is_none()
        && config.providers.values().all(|p| p.api_key.is_none());
    if !local && no_key {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    OPENROUTER_API_KEY   (recommended)");
        eprintln!("    OPENAI_API_KEY");
        eprintln!("    ARBITER_API_KEY");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let event_bus = Arc::new(EventBus::default());
    let pipeline = bootstrap::build_pipeline(&config, event_bus).await?;

    let options = AskOptions {
        session_id: session,
        ..Default::default()
    };

    if stream {
        let mut rx = pipeline.ask_stream(&query, options).await;
        while let Some(event) = rx.recv().await {
            match event {
                AnswerStreamEvent::Chunk { content } => {
                    print!("{content}");
                    std::io::stdout().flush()?;
                }
                AnswerStreamEvent::Error { code, message } => {
                    println!();
                    return Err(format!("Stream failed ({code:?}): {message}").into());
                }
                AnswerStreamEvent::Done { session_id, iterations, .. } => {
                    println!();
                    tracing::debug!(%session_id, iterations, "Stream complete");
                }
            }
        }
        return Ok(());
    }

    let answer = pipeline.ask(&query, options).await?;
    println!("{}", answer.answer);

    if sources {
        println!();
        println!("Session:   {}", answer.session_id);
        println!("Strategy:  {}", answer.route.strategy.as_str());
        println!("Elapsed:   {} ms", answer.execution_time_ms);
        println!("Sources:");
        for hit in &answer.sources {
            let tag = hit
                .conflict_resolution
                .as_ref()
                .map(|ann| format!(" [{:?}: {}]", ann.status, ann.reason))
                .unwrap_or_default();
            println!(
                "  {} score={:.2}{} {}",
                hit.partition_id, hit.score, tag, hit.document_id
            );
        }
        if !answer.conflicts.is_empty() {
            println!("Conflicts:");
            for report in &answer.conflicts {
                println!(
                    "  {} vs {}: {} wins ({})",
                    report.partition_a,
                    report.partition_b,
                    report.winner_partition,
                    report.reason
                );
            }
        }
        if !answer.failed_partitions.is_empty() {
            println!("Degraded partitions: {}", answer.failed_partitions.join(", "));
        }
    }

    Ok(())
}
