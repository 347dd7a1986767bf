//! Turns recipient rows into sendable messages, optionally through a template.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::{recipient_address, value_to_text, MessagePayload, RecipientRow};
use crate::templates::{render_text, Template, TemplateError};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("recipient row is missing 'to'")]
    MissingRecipient,
    #[error("invalid payload: {0}")]
    Invalid(String),
}

/// Builds the message for one recipient row.
pub trait PayloadBuilder: Send + Sync {
    fn build(&self, row: &RecipientRow) -> Result<MessagePayload, PayloadError>;
}

/// Subject/body/from applied to every row of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BatchTemplate {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, alias = "from_address")]
    pub from: Option<String>,
}

impl BatchTemplate {
    /// Load a JSON object with `subject`, `body` and `from` / `from_address`.
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let raw = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        if !value.is_object() {
            return Err(TemplateError::Invalid(
                "template file must be a JSON object".into(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Use a stored `.hbs` template: its frontmatter supplies subject and sender.
    pub fn from_template(template: &Template) -> Self {
        Self {
            subject: template.metadata_text("subject").unwrap_or_default(),
            body: template.body.clone(),
            from: template
                .metadata_text("from")
                .or_else(|| template.metadata_text("from_address")),
        }
    }
}

/// Default builder: renders the batch template against each row, or reads
/// `subject` / `body` / `from` straight from the row when there is none.
#[derive(Debug, Clone, Default)]
pub struct TemplatePayloadBuilder {
    template: Option<BatchTemplate>,
}

impl TemplatePayloadBuilder {
    pub fn new(template: Option<BatchTemplate>) -> Self {
        Self { template }
    }
}

impl PayloadBuilder for TemplatePayloadBuilder {
    fn build(&self, row: &RecipientRow) -> Result<MessagePayload, PayloadError> {
        let to = recipient_address(row).ok_or(PayloadError::MissingRecipient)?;
        if to.trim().is_empty() {
            return Err(PayloadError::MissingRecipient);
        }

        let (subject, body, from_address) = match &self.template {
            Some(template) => (
                render_text(&template.subject, row),
                render_text(&template.body, row),
                template.from.clone(),
            ),
            None => (
                row_text(row, "subject").unwrap_or_default(),
                row_text(row, "body").unwrap_or_default(),
                row_text(row, "from").or_else(|| row_text(row, "from_address")),
            ),
        };

        Ok(MessagePayload {
            to,
            subject,
            body,
            from_address: from_address.filter(|f| !f.is_empty()),
        })
    }
}

fn row_text(row: &RecipientRow, key: &str) -> Option<String> {
    row.get(key)
        .and_then(value_to_text)
        .filter(|s| !s.is_empty())
}
