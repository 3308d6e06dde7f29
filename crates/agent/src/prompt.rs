//! System prompt assembly — persona, retrieval context, tool catalogue.

use arbiter_config::PersonaConfig;
use arbiter_core::retrieval::{ConflictStatus, RetrievalHit};
use arbiter_core::tool::ToolDescriptor;

/// Builds the system prompt the reasoning loop sends each iteration.
pub struct PromptBuilder {
    persona: PersonaConfig,
}

impl PromptBuilder {
    pub fn new(persona: PersonaConfig) -> Self {
        Self { persona }
    }

    /// Assemble the full system prompt.
    ///
    /// Retrieval hits arrive already reconciled; conflict annotations
    /// are surfaced so the model prefers the winning source.
    pub fn build(&self, hits: &[RetrievalHit], tools: &[ToolDescriptor]) -> String {
        let mut prompt = format!("You are {}. {}\n", self.persona.name, self.persona.description);

        if !hits.is_empty() {
            prompt.push_str("\n## Retrieved context\n");
            for (i, hit) in hits.iter().enumerate() {
                let tag = match &hit.conflict_resolution {
                    Some(ann) => match ann.status {
                        ConflictStatus::Preferred => format!(" [preferred: {}]", ann.reason),
                        ConflictStatus::Outdated => format!(" [outdated: {}]", ann.reason),
                        ConflictStatus::Alternate => format!(" [alternate: {}]", ann.reason),
                    },
                    None => String::new(),
                };
                prompt.push_str(&format!(
                    "{}. ({} score={:.2}){} {}\n",
                    i + 1,
                    hit.partition_id,
                    hit.score,
                    tag,
                    hit.text
                ));
            }
            prompt.push_str(
                "\nWhen sources disagree, rely on entries marked [preferred] and treat \
                 [outdated] or [alternate] entries as superseded background.\n",
            );
        }

        if !tools.is_empty() {
            prompt.push_str("\n## Available tools\n");
            for tool in tools {
                prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
            }
            prompt.push_str(
                "\nTo use a tool, respond with a single JSON object:\n\
                 {\"action\": \"<tool name>\", \"input\": { ... }}\n\
                 You will receive the tool's output as an observation.\n",
            );
        }

        prompt.push_str(
            "\nWhen you have enough information, respond with:\n\
             {\"final_answer\": \"<your answer>\"}\n\
             or with plain text, which is treated as your final answer.\n\
             Private reasoning may go inside <scratch>...</scratch> tags; it will \
             not be shown to the user.\n",
        );

        prompt
    }
}
