//! `arbiter tools` — list the available tools.

use std::sync::Arc;

use arbiter_config::AppConfig;
use arbiter_core::event::EventBus;

use crate::bootstrap;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let event_bus = Arc::new(EventBus::default());
    let dispatcher =
        bootstrap::build_dispatcher(&config, bootstrap::seeded_partitions(), event_bus).await?;

    println!("Available tools:");
    for descriptor in dispatcher.descriptors() {
        println!("  {:<18} {}", descriptor.name, descriptor.description);
    }
    if config.tool_protocol.is_some() {
        println!();
        println!(
            "Tool protocol: {}",
            config
                .tool_protocol
                .as_ref()
                .map(|p| p.base_url.as_str())
                .unwrap_or_default()
        );
    }

    Ok(())
}
