//! Our OpenAI driver, which we also use for LiteLLM, Ollama and other
//! compatible gateways.

use std::sync::LazyLock;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateChatCompletionResponse, FinishReason},
};
use leaky_bucket::RateLimiter;
use regex::Regex;

use crate::{
    config::OpenAiCredentials,
    drivers::{LlmError, TokenUsage},
    prelude::*,
    prompt::{RenderedMessage, RenderedPrompt},
    rate_limit::RateLimit,
    retry::{retry_result_fatal, retry_result_ok, try_fatal, try_potentially_transient, try_transient},
};

use super::{ChatCompletionResponse, CompletionRequest, Driver, LlmRetryResult};

/// Matches the outermost JSON object in a response that has extra text around
/// it, such as Markdown code fences.
static EMBEDDED_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("failed to compile regex"));

/// Our OpenAI driver.
pub struct OpenAiDriver {
    /// The OpenAI client.
    client: Client<OpenAIConfig>,

    /// Spaces out our requests, if the user asked for that.
    rate_limiter: Option<RateLimiter>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver.
    pub fn new(credentials: &OpenAiCredentials, rate_limit: Option<&RateLimit>) -> Self {
        let mut client_config = OpenAIConfig::new().with_api_key(&credentials.api_key);
        if let Some(api_base) = &credentials.api_base {
            client_config = client_config.with_api_base(api_base);
        }
        Self {
            client: Client::with_config(client_config),
            rate_limiter: rate_limit.map(RateLimit::to_rate_limiter),
        }
    }
}

#[async_trait]
impl Driver for OpenAiDriver {
    #[instrument(level = "debug", skip_all, fields(model = %request.model))]
    async fn chat_completion(
        &self,
        request: &CompletionRequest<'_>,
    ) -> LlmRetryResult<ChatCompletionResponse> {
        let req = build_request(request);
        trace!(%req, "Request");

        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        // Call OpenAI.
        let chat = self.client.chat();
        let chat_result: Value = try_potentially_transient!(
            LlmError::apply_timeout(request.timeout, chat.create_byot(req)).await
        );
        debug!(%chat_result, "OpenAI response");
        let response = try_fatal!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
                .context("Error parsing OpenAI response")
        );

        // How many tokens did we use?
        let token_usage = response.usage.map(|usage| TokenUsage {
            prompt_tokens: u64::from(usage.prompt_tokens),
            completion_tokens: u64::from(usage.completion_tokens),
        });

        // Get the content from our response & parse as JSON.
        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("No choices in OpenAI response"));
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!("Content filter triggered"));
        }
        let content = choice.message.content.as_deref().unwrap_or_default();
        // If we didn't get JSON here, it's because the model didn't generate
        // JSON. So give it another chance.
        let response = try_transient!(parse_json_content(content));
        retry_result_ok(ChatCompletionResponse {
            response,
            token_usage,
        })
    }
}

/// Build a `/chat/completions` request body.
fn build_request(request: &CompletionRequest<'_>) -> Value {
    let messages = to_openai_messages(request.prompt);

    // OpenAI rejects the `$schema` key, and "strict" mode requires every
    // property to be listed as required, which our optional fields are not.
    let mut schema = request.schema.clone();
    if let Some(schema) = schema.as_object_mut() {
        schema.remove("$schema");
    }
    let name = request
        .schema
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("ResponseFormat")
        .to_owned();

    let mut req = json!({
        "model": request.model,
        "messages": messages,
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": name,
                "schema": schema,
                "strict": false,
            },
        },
    });
    if let Some(max_completion_tokens) = request.max_completion_tokens {
        req["max_completion_tokens"] = json!(max_completion_tokens);
    }
    if let Some(temperature) = request.temperature {
        req["temperature"] = json!(temperature);
    }
    req
}

/// Convert a rendered prompt into OpenAI's message format.
fn to_openai_messages(prompt: &RenderedPrompt) -> Vec<Value> {
    prompt
        .messages
        .iter()
        .map(|message| match message {
            RenderedMessage::System { text } => json!({ "role": "system", "content": text }),
            RenderedMessage::User { text, images } if images.is_empty() => {
                json!({ "role": "user", "content": text })
            }
            RenderedMessage::User { text, images } => {
                let mut content = vec![json!({ "type": "text", "text": text })];
                content.extend(images.iter().map(|url| {
                    json!({ "type": "image_url", "image_url": { "url": url } })
                }));
                json!({ "role": "user", "content": content })
            }
            RenderedMessage::Assistant { text } => {
                json!({ "role": "assistant", "content": text })
            }
        })
        .collect()
}

/// Parse the JSON content of a response, tolerating extra text around the
/// object.
fn parse_json_content(content: &str) -> Result<Value> {
    match serde_json::from_str::<Value>(content) {
        Ok(value) => Ok(value),
        Err(err) => {
            let embedded = EMBEDDED_JSON_RE
                .find(content)
                .ok_or_else(|| anyhow!("no JSON object in response: {:?}", content))?;
            serde_json::from_str::<Value>(embedded.as_str()).with_context(|| {
                format!("Error parsing OpenAI response content ({err}): {:?}", content)
            })
        }
    }
}
