//! OpenAI-compatible chat-completions client.
//!
//! [`ChatCompletionsGenerator`] implements the core
//! [`TextGenerator`] trait against any endpoint that speaks the
//! `POST {base_url}/chat/completions` protocol (OpenAI, DeepSeek, Qwen,
//! Moonshot, a local Ollama, ...). Per-model `base_url` and `api_key_env`
//! from the registry override the `[generation]` defaults.
//!
//! Calls are made once. A failed request is reported as an unsuccessful
//! [`GenerationResponse`]; whether to retry is the caller's decision.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use narrative_forge_core::router::{GenerationResponse, ModelCallConfig, TextGenerator};

use crate::config::GenerationConfig;

pub struct ChatCompletionsGenerator {
    client: reqwest::Client,
    config: GenerationConfig,
}

impl ChatCompletionsGenerator {
    pub fn new(config: GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    async fn complete(
        &self,
        prompt: &str,
        call: &ModelCallConfig,
        system_prompt: Option<&str>,
    ) -> Result<String> {
        let base_url = call
            .base_url
            .as_deref()
            .unwrap_or(&self.config.base_url)
            .trim_end_matches('/');
        let key_env = call
            .api_key_env
            .as_deref()
            .unwrap_or(&self.config.api_key_env);
        // Local endpoints such as Ollama accept unauthenticated requests.
        let api_key = std::env::var(key_env).ok();
        if api_key.is_none() && call.provider != "ollama" {
            bail!("{} environment variable not set", key_env);
        }

        let body = build_request_body(prompt, call, system_prompt, self.config.temperature);
        let mut request = self
            .client
            .post(format!("{}/chat/completions", base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", base_url))?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Chat completion API error {}: {}", status, body_text);
        }

        let json: Value = response.json().await?;
        parse_chat_response(&json)
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionsGenerator {
    async fn generate_text(
        &self,
        prompt: &str,
        config: &ModelCallConfig,
        system_prompt: Option<&str>,
    ) -> GenerationResponse {
        match self.complete(prompt, config, system_prompt).await {
            Ok(text) => GenerationResponse::ok(text),
            Err(e) => GenerationResponse::failed(format!("{e:#}")),
        }
    }
}

fn build_request_body(
    prompt: &str,
    call: &ModelCallConfig,
    system_prompt: Option<&str>,
    default_temperature: Option<f32>,
) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = system_prompt {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": prompt}));

    let mut body = json!({
        "model": call.model,
        "messages": messages,
        "max_tokens": call.max_tokens,
    });
    if let Some(temperature) = call.temperature.or(default_temperature) {
        body["temperature"] = json!(temperature);
    }
    if call.json_output {
        body["response_format"] = json!({"type": "json_object"});
    }
    body
}

/// Extract `choices[0].message.content`.
fn parse_chat_response(json: &Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.pointer("/message/content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid chat completion response: missing choices[0].message.content"))
}
