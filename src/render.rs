//! Rendering events into email bodies.

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::{Captures, Regex};

use crate::error::RenderError;
use crate::model::{CONTEXT_TEMPLATE, Event};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\s*\}\}").expect("valid regex")
});

static TEMPLATE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-]+(?:/[A-Za-z0-9_\-]+)*$").expect("valid regex"));

/// HTML and plain-text bodies of one email. Either may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedEmail {
    pub html: String,
    pub text: String,
}

/// Turns an event into email bodies.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, event: &Event) -> Result<RenderedEmail, RenderError>;
}

/// Renders `<dir>/<template>.html` and `<dir>/<template>.txt`, where the
/// template name comes from the event context.
///
/// `{{ key }}` and `{{ key.nested }}` placeholders are filled from the
/// context; values are HTML-escaped in the HTML body. Without a template
/// name the context's `html` and `text` strings are used as-is.
pub struct TemplateRenderer {
    dir: PathBuf,
}

impl TemplateRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load(&self, name: &str, extension: &str) -> Result<Option<String>, RenderError> {
        let path = self.dir.join(format!("{name}.{extension}"));
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(RenderError::TemplateIo { path, source }),
        }
    }
}

#[async_trait]
impl Renderer for TemplateRenderer {
    async fn render(&self, event: &Event) -> Result<RenderedEmail, RenderError> {
        let Some(name) = event.context_str(CONTEXT_TEMPLATE) else {
            return Ok(RenderedEmail {
                html: event.context_str("html").unwrap_or_default().to_string(),
                text: event.context_str("text").unwrap_or_default().to_string(),
            });
        };

        if !TEMPLATE_NAME.is_match(name) {
            return Err(RenderError::InvalidTemplateName(name.to_string()));
        }

        let html = self.load(name, "html").await?;
        let text = self.load(name, "txt").await?;
        if html.is_none() && text.is_none() {
            tracing::warn!(event_id = %event.id, template = name, "No template files found");
        }

        Ok(RenderedEmail {
            html: html
                .map(|t| fill(&t, &event.context, escape_html))
                .unwrap_or_default(),
            text: text
                .map(|t| fill(&t, &event.context, str::to_string))
                .unwrap_or_default(),
        })
    }
}

/// Replace placeholders in `template` with context values. Missing keys render empty.
fn fill(template: &str, context: &serde_json::Value, escape: fn(&str) -> String) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let value = caps[1]
                .split('.')
                .try_fold(context, |value, key| value.get(key));
            match value {
                Some(serde_json::Value::String(s)) => escape(s),
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => escape(&other.to_string()),
            }
        })
        .into_owned()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
