use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::AppError,
    prompting::{render_answer_system_prompt, render_answer_user_prompt, AnswerPromptContext},
};

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces a reply to an inbound customer message. `Ok(None)` means the
/// generator had nothing to say.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(
        &self,
        customer_name: &str,
        product_name: &str,
        inbound_text: &str,
    ) -> Result<Option<String>, AppError>;
}

pub struct OpenAiAnswerGenerator {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    business_name: String,
}

impl OpenAiAnswerGenerator {
    pub fn new(
        http: reqwest::Client,
        api_key: &str,
        model: &str,
        base_url: &str,
        business_name: &str,
    ) -> Self {
        Self {
            http,
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            business_name: business_name.to_string(),
        }
    }
}

#[async_trait]
impl AnswerGenerator for OpenAiAnswerGenerator {
    async fn generate(
        &self,
        customer_name: &str,
        product_name: &str,
        inbound_text: &str,
    ) -> Result<Option<String>, AppError> {
        if self.api_key.is_empty() {
            return Err(AppError::AnswerGeneration(
                "OPENAI_API_KEY not configured".to_string(),
            ));
        }
        let ctx = AnswerPromptContext {
            business_name: &self.business_name,
            customer_name,
            product: product_name,
            inbound_text,
        };
        let system = render_answer_system_prompt(&ctx);
        let user = render_answer_user_prompt(&ctx);
        debug!(model = %self.model, "requesting answer completion");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(COMPLETION_TIMEOUT)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
                "temperature": 0.4
            }))
            .send()
            .await
            .map_err(|err| AppError::AnswerGeneration(format!("openai request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::AnswerGeneration(format!(
                "openai returned {status}: {body}"
            )));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| AppError::AnswerGeneration(format!("openai parse failed: {err}")))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }
}
