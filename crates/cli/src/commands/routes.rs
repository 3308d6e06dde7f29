//! `arbiter routes` — show the routing decision for a query.

use arbiter_config::AppConfig;
use arbiter_retrieval::{QueryRouter, QuerySignals};

pub async fn run(query: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let router = QueryRouter::new(config.routing.clone());
    let route = router.route(&query, &QuerySignals::default());

    println!("Query:      {query}");
    println!("Strategy:   {}", route.strategy.as_str());
    println!("Partitions: {}", route.partitions.join(", "));

    Ok(())
}
