//! Chat template rendering.
//!
//! Conversations are turned into a single prompt string with a Jinja2-style
//! template. The built-in template is plain ChatML; a custom template can be
//! supplied for models that expect something else.

use minijinja::{Environment, ErrorKind, Value, context};

use crate::error::LlmResult;
use crate::marker::STOP_MARKER;
use crate::types::ChatMessage;

/// ChatML: every message is wrapped in `<|im_start|>{role}` / `<|im_end|>`,
/// followed by an open assistant turn.
pub const CHATML_TEMPLATE: &str = r#"{%- for message in messages %}
    {{- '<|im_start|>' + message['role'] + '\n' + message['content'] + '<|im_end|>\n' }}
{%- endfor %}
{%- if add_generation_prompt %}
    {{- '<|im_start|>assistant\n' }}
{%- endif %}"#;

/// Chat template processor for formatting messages.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    template: String,
    add_generation_prompt: bool,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::chatml()
    }
}

impl ChatTemplate {
    /// Create a template from Jinja2 source.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            add_generation_prompt: true,
        }
    }

    /// The built-in ChatML template.
    pub fn chatml() -> Self {
        Self::new(CHATML_TEMPLATE)
    }

    /// Set whether to open an assistant turn at the end.
    #[must_use]
    pub fn with_generation_prompt(mut self, add: bool) -> Self {
        self.add_generation_prompt = add;
        self
    }

    /// Check that the template parses.
    pub fn validate(&self) -> LlmResult<()> {
        let mut env = environment();
        env.add_template("chat", &self.template)?;
        Ok(())
    }

    /// Render `messages` into a prompt ready for tokenization.
    pub fn apply(&self, messages: &[ChatMessage]) -> LlmResult<String> {
        let mut env = environment();
        env.add_template("chat", &self.template)?;
        let template = env.get_template("chat")?;

        let rendered = template.render(context! {
            messages => Value::from_serialize(messages),
            add_generation_prompt => self.add_generation_prompt,
            bos_token => "",
            eos_token => STOP_MARKER,
        })?;
        Ok(rendered)
    }
}

fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();

    // Python string methods that HF templates tend to call.
    env.set_unknown_method_callback(|_state, value, method, args| {
        if let Some(s) = value.as_str() {
            let arg = || {
                args.first().and_then(|v| v.as_str()).ok_or_else(|| {
                    minijinja::Error::new(
                        ErrorKind::InvalidOperation,
                        format!("{method} requires a string argument"),
                    )
                })
            };
            match method {
                "startswith" => return Ok(Value::from(s.starts_with(arg()?))),
                "endswith" => return Ok(Value::from(s.ends_with(arg()?))),
                "strip" => return Ok(Value::from(s.trim())),
                _ => {}
            }
        }
        Err(minijinja::Error::new(
            ErrorKind::UnknownMethod,
            format!("object has no method named {method}"),
        ))
    });

    env.add_function(
        "raise_exception",
        |msg: String| -> Result<String, minijinja::Error> {
            Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
        },
    );

    env
}
