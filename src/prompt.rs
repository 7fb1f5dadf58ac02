//! Chat prompt templates.
//!
//! Prompts are stored as TOML files with Handlebars templates in their string
//! fields. We render them once per page, then hand the rendered messages to an
//! LLM [`Driver`](crate::drivers::Driver).

use handlebars::Handlebars;
use serde_json::Map;

use crate::{prelude::*, toml_utils::from_toml_str};

/// Template bindings for a prompt.
pub type Bindings = Map<String, Value>;

/// A chat completion prompt template.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    #[serde(default)]
    pub developer: Option<String>,

    /// Messages.
    pub messages: Vec<MessageTemplate>,
}

/// A user message, and optionally a canned assistant response.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageTemplate {
    /// The user message.
    pub user: String,

    /// Images to attach to the user message, normally `data:` URLs.
    #[serde(default)]
    pub images: Vec<String>,

    /// An example assistant response, for few-shot prompts.
    #[serde(default)]
    pub assistant: Option<String>,
}

impl ChatPrompt {
    /// Parse a prompt from TOML.
    pub fn from_toml(description: &str, toml_str: &str) -> Result<Self> {
        let prompt: Self = from_toml_str(description, toml_str)?;
        if prompt.messages.is_empty() {
            return Err(anyhow!("prompt {description} has no messages"));
        }
        Ok(prompt)
    }

    /// Render all templates using `bindings`. Missing bindings are an error.
    pub fn render(&self, bindings: &Bindings) -> Result<RenderedPrompt> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        // We're producing chat messages, not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);

        let render = |template: &str| -> Result<String> {
            handlebars
                .render_template(template, bindings)
                .context("Error rendering prompt")
        };

        let mut messages = vec![];
        if let Some(developer) = &self.developer {
            messages.push(RenderedMessage::System {
                text: render(developer)?,
            });
        }
        for message in &self.messages {
            messages.push(RenderedMessage::User {
                text: render(&message.user)?,
                images: message
                    .images
                    .iter()
                    .map(|image| render(image))
                    .collect::<Result<Vec<_>>>()?,
            });
            if let Some(assistant) = &message.assistant {
                messages.push(RenderedMessage::Assistant {
                    text: render(assistant)?,
                });
            }
        }
        Ok(RenderedPrompt { messages })
    }
}

/// A prompt with all templates expanded.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedPrompt {
    pub messages: Vec<RenderedMessage>,
}

impl RenderedPrompt {
    /// The text of the last user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|msg| match msg {
            RenderedMessage::User { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// A rendered chat message.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderedMessage {
    System { text: String },
    User { text: String, images: Vec<String> },
    Assistant { text: String },
}
