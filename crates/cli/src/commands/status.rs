//! `arbiter status` — show the effective configuration.

use arbiter_config::AppConfig;
use arbiter_retrieval::ConflictResolver;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    println!("Arbiter Status");
    println!("==============");
    println!("  Config dir:    {}", AppConfig::config_dir().display());
    println!("  Provider:      {}", config.default_provider);
    println!("  Model:         {}", config.default_model);
    println!("  Temperature:   {}", config.default_temperature);
    println!("  Persona:       {}", config.persona.name);
    println!("  Max steps:     {}", config.agent.max_iterations);
    println!("  Task category: {}", config.agent.task_category);
    println!(
        "  Fallback:      {}",
        config.fallback_chain(&config.agent.task_category).join(", ")
    );
    println!("  Partitions:    {}", config.routing.domains.len());
    println!("  Default part.: {}", config.routing.default_partition);
    println!("  Pairs watched: {}", config.conflicts.pairs.len());

    let stats = ConflictResolver::stats();
    println!(
        "  Conflicts:     {} temporal / {} semantic detected this run",
        stats.detected_temporal, stats.detected_semantic
    );

    if let Some(protocol) = &config.tool_protocol {
        println!("  Tool protocol: {}", protocol.base_url);
    }

    Ok(())
}
