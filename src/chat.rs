// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat prompt rendering.
//!
//! Instruct checkpoints ship a Jinja `chat_template` in
//! `tokenizer_config.json`.  [`ChatTemplate`] compiles it with `minijinja`
//! (plus the Python-compatibility string methods templates rely on) and
//! renders a list of [`ChatMessage`]s into the single prompt string the
//! model was fine-tuned on.

use std::path::Path;

use minijinja::{Environment, ErrorKind, context};
use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that frame the conversation.
    System,
    /// The human turn.
    User,
    /// The model turn.
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Who is speaking.
    pub role: Role,
    /// What they said.
    pub content: String,
}

impl ChatMessage {
    /// A system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// `[system?, user]`.
#[must_use]
pub fn conversation(system_prompt: Option<&str>, prompt: &str) -> Vec<ChatMessage> {
    system_prompt
        .map(ChatMessage::system)
        .into_iter()
        .chain(std::iter::once(ChatMessage::user(prompt)))
        .collect()
}

/// Render messages without a template: contents joined by blank lines.
///
/// Used for base checkpoints that ship no chat template.
#[must_use]
pub fn render_plain(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ---------------------------------------------------------------------------
// tokenizer_config.json
// ---------------------------------------------------------------------------

/// A special token, written either as a bare string or as an added-token
/// object with a `content` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    /// `"</s>"`
    Plain(String),
    /// `{"content": "</s>", ...}`
    Added {
        /// Token text.
        content: String,
    },
}

impl SpecialToken {
    /// Token text.
    fn into_content(self) -> String {
        match self {
            Self::Plain(s) | Self::Added { content: s } => s,
        }
    }
}

/// `chat_template` is either one template or a list of named templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TemplateField {
    /// A single template.
    Single(String),
    /// Named templates; `default` is the chat one.
    Named(Vec<NamedTemplate>),
}

/// One entry of a named template list.
#[derive(Debug, Clone, Deserialize)]
struct NamedTemplate {
    /// Template name.
    name: String,
    /// Jinja source.
    template: String,
}

/// Raw `tokenizer_config.json` fields.
#[derive(Debug, Deserialize)]
struct RawTokenizerConfig {
    /// Chat template(s).
    #[serde(default)]
    chat_template: Option<TemplateField>,
    /// BOS token.
    #[serde(default)]
    bos_token: Option<SpecialToken>,
    /// EOS token.
    #[serde(default)]
    eos_token: Option<SpecialToken>,
}

/// Parsed `tokenizer_config.json`.
#[derive(Debug, Clone, Default)]
pub struct TokenizerConfig {
    /// Jinja chat template source, if the checkpoint has one.
    pub chat_template: Option<String>,
    /// BOS token text.
    pub bos_token: Option<String>,
    /// EOS token text.
    pub eos_token: Option<String>,
}

impl TokenizerConfig {
    /// Parse a `tokenizer_config.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Io`] if the file cannot be read and
    /// [`ProbeError::Template`] if the JSON is malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse `tokenizer_config.json` content.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Template`] if the JSON is malformed.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawTokenizerConfig = serde_json::from_str(json)
            .map_err(|e| ProbeError::Template(format!("parse tokenizer_config.json: {e}")))?;

        let chat_template = raw.chat_template.and_then(|field| match field {
            TemplateField::Single(s) => Some(s),
            TemplateField::Named(list) => list
                .into_iter()
                .find(|t| t.name == "default")
                .map(|t| t.template),
        });

        Ok(Self {
            chat_template,
            bos_token: raw.bos_token.map(SpecialToken::into_content),
            eos_token: raw.eos_token.map(SpecialToken::into_content),
        })
    }
}

// ---------------------------------------------------------------------------
// ChatTemplate
// ---------------------------------------------------------------------------

/// Name the template is registered under.
const TEMPLATE_NAME: &str = "chat";

/// A compiled chat template.
pub struct ChatTemplate {
    /// Environment owning the compiled template.
    env: Environment<'static>,
    /// Value bound to `bos_token` when rendering.
    bos_token: String,
    /// Value bound to `eos_token` when rendering.
    eos_token: String,
}

impl ChatTemplate {
    /// Compile `source`.
    ///
    /// Blocks are trimmed the way `transformers` compiles templates, and
    /// `raise_exception(msg)` is available for templates that validate
    /// their input.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Template`] on a syntax error.
    pub fn new(
        source: impl Into<String>,
        bos_token: Option<String>,
        eos_token: Option<String>,
    ) -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        env.add_function(
            "raise_exception",
            |msg: String| -> std::result::Result<String, minijinja::Error> {
                Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
            },
        );
        env.add_template_owned(TEMPLATE_NAME, source.into())
            .map_err(|e| ProbeError::Template(format!("invalid template: {e}")))?;

        Ok(Self {
            env,
            bos_token: bos_token.unwrap_or_default(),
            eos_token: eos_token.unwrap_or_default(),
        })
    }

    /// Compile the template declared in a parsed `tokenizer_config.json`.
    ///
    /// Returns `Ok(None)` for checkpoints without one.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Template`] on a syntax error.
    pub fn from_tokenizer_config(config: &TokenizerConfig) -> Result<Option<Self>> {
        config
            .chat_template
            .as_ref()
            .map(|source| {
                Self::new(
                    source.clone(),
                    config.bos_token.clone(),
                    config.eos_token.clone(),
                )
            })
            .transpose()
    }

    /// Render `messages`, optionally opening an assistant turn.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Template`] if rendering fails, including a
    /// `raise_exception` call from the template itself.
    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| ProbeError::Template(e.to_string()))?;
        template
            .render(context!(
                messages => messages,
                add_generation_prompt => add_generation_prompt,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token,
            ))
            .map_err(|e| ProbeError::Template(format!("render failed: {e}")))
    }
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// `ChatML` as used by `Qwen2.5` instruct checkpoints (abridged).
    const CHATML: &str = concat!(
        r"{% for message in messages %}",
        r"{{ '<|im_start|>' + message['role'] + '\n' + message['content'] + '<|im_end|>' + '\n' }}",
        r"{% endfor %}",
        r"{% if add_generation_prompt %}{{ '<|im_start|>assistant\n' }}{% endif %}",
    );

    #[test]
    fn renders_system_and_user() {
        let template = ChatTemplate::new(CHATML, None, Some("<|im_end|>".into())).unwrap();
        let prompt = template
            .render(
                &conversation(Some("You are terse."), "Say hello in one sentence."),
                true,
            )
            .unwrap();
        assert_eq!(
            prompt,
            "<|im_start|>system\nYou are terse.<|im_end|>\n\
             <|im_start|>user\nSay hello in one sentence.<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn generation_prompt_is_optional() {
        let template = ChatTemplate::new(CHATML, None, None).unwrap();
        let prompt = template.render(&[ChatMessage::user("hi")], false).unwrap();
        assert!(!prompt.contains("assistant"));
    }

    #[test]
    fn bos_token_and_python_methods() {
        let source = "{{ bos_token }}{% for m in messages %}{{ m.role.upper() }}: {{ m.content.strip() }}\n{% endfor %}";
        let template = ChatTemplate::new(source, Some("<s>".into()), None).unwrap();
        let prompt = template
            .render(&[ChatMessage::assistant("  ok  ")], false)
            .unwrap();
        assert_eq!(prompt, "<s>ASSISTANT: ok\n");
    }

    #[test]
    fn raise_exception_surfaces_as_template_error() {
        let source = "{% if messages[0]['role'] != 'user' %}{{ raise_exception('user first') }}{% endif %}";
        let template = ChatTemplate::new(source, None, None).unwrap();
        let err = template
            .render(&[ChatMessage::system("x")], true)
            .unwrap_err();
        assert!(matches!(err, ProbeError::Template(_)));
        assert!(err.to_string().contains("user first"));
    }

    #[test]
    fn syntax_error_is_rejected() {
        assert!(ChatTemplate::new("{% for %}", None, None).is_err());
    }

    #[test]
    fn tokenizer_config_token_forms() {
        let config = TokenizerConfig::from_json_str(
            r#"{"chat_template": "{{ messages[0].content }}",
                "bos_token": {"content": "<s>", "lstrip": false},
                "eos_token": "</s>"}"#,
        )
        .unwrap();
        assert_eq!(config.bos_token.as_deref(), Some("<s>"));
        assert_eq!(config.eos_token.as_deref(), Some("</s>"));
        let template = ChatTemplate::from_tokenizer_config(&config).unwrap().unwrap();
        assert_eq!(template.render(&[ChatMessage::user("x")], true).unwrap(), "x");
    }

    #[test]
    fn named_template_list_picks_default() {
        let config = TokenizerConfig::from_json_str(
            r#"{"chat_template": [
                {"name": "tool_use", "template": "tools"},
                {"name": "default", "template": "chat"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(config.chat_template.as_deref(), Some("chat"));
    }

    #[test]
    fn missing_template_is_none() {
        let config = TokenizerConfig::from_json_str(r#"{"eos_token": "<|endoftext|>"}"#).unwrap();
        assert!(ChatTemplate::from_tokenizer_config(&config).unwrap().is_none());
    }

    #[test]
    fn plain_rendering_keeps_both_turns() {
        let text = render_plain(&conversation(Some("Be brief."), "Hello"));
        assert_eq!(text, "Be brief.\n\nHello");
    }
}
