//! Shared assembly for the CLI commands: the demo knowledge base and
//! the fully wired answer pipeline.

use std::sync::Arc;

use arbiter_agent::{AnswerPipeline, PromptBuilder, ReasoningLoop};
use arbiter_config::AppConfig;
use arbiter_core::event::EventBus;
use arbiter_core::retrieval::PartitionClient;
use arbiter_providers::ProviderRegistry;
use arbiter_retrieval::InMemoryPartitions;
use arbiter_retrieval::memory::SeedDocument;
use arbiter_tools::{HttpProtocolClient, ToolDispatcher};
use chrono::TimeZone;

/// The demo knowledge base: three partitions of tax-advisory content.
///
/// `tax_updates` deliberately contradicts `tax_knowledge` on the
/// deduction cap so the conflict resolver has something to settle.
pub fn seeded_partitions() -> Arc<InMemoryPartitions> {
    let partitions = InMemoryPartitions::new();

    partitions.seed(
        "tax_knowledge",
        vec![
            SeedDocument {
                id: "kb-standard-rate".into(),
                text: "The standard VAT rate is 21 percent and applies to most \
                       goods and services unless a reduced rate is listed."
                    .into(),
                timestamp: None,
                tags: vec!["vat".into()],
            },
            SeedDocument {
                id: "kb-deduction-cap".into(),
                text: "The annual home-office deduction cap is 1000 for income \
                       tax filings."
                    .into(),
                timestamp: None,
                tags: vec!["deduction".into()],
            },
            SeedDocument {
                id: "kb-filing-deadline".into(),
                text: "Income tax returns must be filed by May 1. Extensions can \
                       be requested before the deadline."
                    .into(),
                timestamp: None,
                tags: vec!["filing".into()],
            },
        ],
    );

    partitions.seed(
        "tax_updates",
        vec![
            SeedDocument {
                id: "up-deduction-cap".into(),
                text: "New rule this year: the home-office deduction cap is \
                       raised from 1000 to 1200."
                    .into(),
                timestamp: chrono::Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).single(),
                tags: vec!["deduction".into(), "update".into()],
            },
            SeedDocument {
                id: "up-reduced-rate".into(),
                text: "Latest change: the reduced VAT rate for repairs drops to \
                       9 percent."
                    .into(),
                timestamp: chrono::Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single(),
                tags: vec!["vat".into(), "update".into()],
            },
        ],
    );

    partitions.seed(
        "payroll",
        vec![
            SeedDocument {
                id: "pr-withholding".into(),
                text: "Employers withhold wage tax monthly based on the payroll \
                       tax tables for the current year."
                    .into(),
                timestamp: None,
                tags: vec!["salary".into()],
            },
            SeedDocument {
                id: "pr-bonus".into(),
                text: "Bonus payments are taxed at the special remuneration rate, \
                       which is usually higher than the regular wage rate."
                    .into(),
                timestamp: None,
                tags: vec!["salary".into(), "bonus".into()],
            },
        ],
    );

    Arc::new(partitions)
}

/// Build the tool dispatcher: native tools plus, when configured, tools
/// discovered over the external tool protocol.
pub async fn build_dispatcher(
    config: &AppConfig,
    partitions: Arc<dyn PartitionClient>,
    event_bus: Arc<EventBus>,
) -> Result<ToolDispatcher, Box<dyn std::error::Error>> {
    let registry =
        arbiter_tools::default_registry(partitions, &config.routing.default_partition);
    let mut dispatcher = ToolDispatcher::new(registry).with_events(event_bus);

    if let Some(protocol) = &config.tool_protocol {
        let client = HttpProtocolClient::from_config(protocol)?;
        dispatcher.attach_protocol(Arc::new(client)).await;
    }

    Ok(dispatcher)
}

/// Wire the whole pipeline from config.
pub async fn build_pipeline(
    config: &AppConfig,
    event_bus: Arc<EventBus>,
) -> Result<AnswerPipeline, Box<dyn std::error::Error>> {
    let registry = ProviderRegistry::from_config(config)?;
    let chain = registry.chain_for(config, &config.agent.task_category, Some(event_bus.clone()))?;

    let partitions: Arc<dyn PartitionClient> = seeded_partitions();
    let dispatcher = build_dispatcher(config, partitions.clone(), event_bus.clone()).await?;

    let runner = ReasoningLoop::new(
        Arc::new(chain),
        &config.default_model,
        Arc::new(dispatcher),
        PromptBuilder::new(config.persona.clone()),
        event_bus.clone(),
    )
    .with_max_iterations(config.agent.max_iterations)
    .with_temperature(config.default_temperature)
    .with_max_tokens(config.default_max_tokens);

    Ok(AnswerPipeline::new(
        config,
        partitions,
        Arc::new(runner),
        event_bus,
    ))
}
