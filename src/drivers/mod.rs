//! LLM drivers.
//!
//! Both the vision-language OCR backend and the content enhancer talk to an
//! LLM through the [`Driver`] trait. In production this is always the OpenAI
//! driver (which also works with LiteLLM, Ollama and other compatible
//! gateways), but tests plug in scripted drivers here.

use std::{error, fmt, ops::AddAssign, time::Duration};

use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::RetryResult;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::{
    async_utils::{BoxedFuture, with_timeout},
    prelude::*,
    prompt::RenderedPrompt,
    retry::{IsKnownTransient, retry_result_ok, try_transient},
    schema::ResponseSchema,
};

pub mod openai;

/// A [`RetryResult`] for LLM requests. This allows [`Driver`] instances to
/// distinguish between errors that may be transient, and errors that are
/// definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Everything a driver needs to run one chat completion.
#[derive(Debug)]
pub struct CompletionRequest<'a> {
    /// The model to call.
    pub model: &'a str,

    /// The rendered prompt.
    pub prompt: &'a RenderedPrompt,

    /// JSON Schema the response should follow.
    pub schema: &'a Value,

    /// An upper limit on the number of completion tokens to generate.
    pub max_completion_tokens: Option<u32>,

    /// The temperature to use for sampling, if not the model's default.
    pub temperature: Option<f32>,

    /// How long to wait for a complete response.
    pub timeout: Duration,
}

/// Interface trait for LLM drivers.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Run a "chat completion" request that returns a JSON object.
    async fn chat_completion(
        &self,
        request: &CompletionRequest<'_>,
    ) -> LlmRetryResult<ChatCompletionResponse>;
}

/// Run a chat completion and check the response against `schema`.
///
/// Schema validation failure is treated as a transient failure, because it
/// may be caused by a dodgy implementation of `response_format` by a specific
/// LLM endpoint.
pub async fn structured_completion<T>(
    driver: &dyn Driver,
    request: &CompletionRequest<'_>,
    schema: &ResponseSchema,
) -> LlmRetryResult<(T, Option<TokenUsage>)>
where
    T: DeserializeOwned,
{
    let completion = match driver.chat_completion(request).await {
        RetryResult::Ok { output, .. } => output,
        RetryResult::Transient { input, error } => {
            return RetryResult::Transient { input, error };
        }
        RetryResult::Fatal { input, error } => {
            return RetryResult::Fatal { input, error };
        }
    };
    let parsed = try_transient!(schema.parse::<T>(completion.response));
    retry_result_ok((parsed, completion.token_usage))
}

/// A chat completion response.
#[derive(Debug)]
pub struct ChatCompletionResponse {
    /// Structured response from the LLM. This will not have been
    /// validated yet.
    pub response: Value,

    /// Token usage.
    pub token_usage: Option<TokenUsage>,
}

/// Token usage.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TokenUsage {
    /// How many tokens were used in the prompt?
    pub prompt_tokens: u64,

    /// How many tokens were used in the response?
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Was our token usage zero?
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// An error which occurred while calling an LLM.
///
/// Used internally by drivers to handle timeouts.
#[derive(Debug)]
pub enum LlmError<E> {
    /// A native error.
    Native(E),

    /// A timeout error.
    Timeout(Duration),
}

impl<E> LlmError<E>
where
    E: Send + 'static,
{
    /// Apply a timeout to a driver future, merging the timeout into our error
    /// type.
    pub fn apply_timeout<'fut, T>(
        timeout: Duration,
        future: impl Future<Output = Result<T, E>> + Send + 'fut,
    ) -> BoxedFuture<'fut, Result<T, LlmError<E>>>
    where
        T: Send + 'fut,
        E: 'fut,
    {
        with_timeout(timeout, future.map_err(LlmError::Native))
            // We have a `Result<Result<T, LlmError<E>>, TimedOut>` here, and
            // we want a `Result<T, LlmError<E>>`.
            .map(move |result| match result {
                Ok(inner) => inner,
                Err(timed_out) => Err(LlmError::Timeout(timed_out.after)),
            })
            .boxed()
    }
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Runaway LLM responses and some kinds of network timeouts can be retried
            // with hope of a better result.
            LlmError::Timeout(_) => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout(after) => {
                write!(f, "LLM request timed out after {}s", after.as_secs())
            }
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout(_) => None,
        }
    }
}
