use async_trait::async_trait;
use clinical_core::{CoreError, DecisionModel};
use rig::{agent::Agent, client::CompletionClient, completion::Prompt, providers::openrouter};

const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

const REVIEWER_PREAMBLE: &str = "You are a nephrology claims review assistant. \
You evaluate kidney-disease treatment appeals from extracted clinical values \
and always answer in the exact JSON shape the prompt asks for.";

/// OpenRouter-backed implementation of the decision model seam. One call per
/// decision, no retries; failures are reported upward and handled by the rule
/// fallback.
pub struct OpenRouterDecisionModel {
    agent: Agent<openrouter::CompletionModel>,
}

impl OpenRouterDecisionModel {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENROUTER_API_KEY not set"))?;
        let model =
            std::env::var("DECISION_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let client = openrouter::Client::new(&api_key);
        let agent = client.agent(&model).preamble(REVIEWER_PREAMBLE).build();
        Ok(Self { agent })
    }
}

#[async_trait]
impl DecisionModel for OpenRouterDecisionModel {
    async fn generate(&self, prompt: &str) -> clinical_core::Result<String> {
        self.agent
            .prompt(prompt)
            .await
            .map_err(|e| CoreError::ModelCall(e.to_string()))
    }
}
