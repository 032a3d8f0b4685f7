//! Message templates with named placeholders.
//!
//! A template is plain text with `{field}` placeholders resolved against a
//! recipient's attributes. Literal braces are written as `{{` and `}}`.
//! Templates are parsed once; the set of required placeholders is checked
//! against the source columns before any message is sent, and rendering
//! refuses to produce partially substituted text.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed placeholder starting at byte {0}")]
    UnclosedPlaceholder(usize),

    #[error("unmatched '}}' at byte {0} (write '}}}}' for a literal brace)")]
    UnmatchedClose(usize),

    #[error("empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),

    #[error("template references fields missing from the recipient source: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("recipient has no value for placeholder '{0}'")]
    MissingAttribute(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed message template
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    segments: Vec<Segment>,
    required: BTreeSet<String>,
}

impl MessageTemplate {
    /// Load and parse a template file. Surrounding whitespace is trimmed.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read message template {}", path.display()))?;

        Self::parse(contents.trim())
            .with_context(|| format!("Invalid message template {}", path.display()))
    }

    pub fn parse(source: &str) -> std::result::Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut required = BTreeSet::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|&(_, n)| n) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|&(_, n)| n) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(TemplateError::UnmatchedClose(pos)),
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, n) in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(TemplateError::UnclosedPlaceholder(pos));
                    }

                    let name = name.trim();
                    if name.is_empty() {
                        return Err(TemplateError::EmptyPlaceholder(pos));
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    required.insert(name.to_string());
                    segments.push(Segment::Placeholder(name.to_string()));
                }
                _ => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments, required })
    }

    /// Placeholder names this template needs
    pub fn required_fields(&self) -> &BTreeSet<String> {
        &self.required
    }

    /// Check every placeholder against the available source columns
    pub fn validate_against<S: AsRef<str>>(
        &self,
        columns: &[S],
    ) -> std::result::Result<(), TemplateError> {
        let available: BTreeSet<&str> = columns.iter().map(|c| c.as_ref()).collect();
        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|name| !available.contains(name.as_str()))
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(TemplateError::MissingFields(missing))
        }
    }

    /// Render against a recipient's attributes, substituting every placeholder
    pub fn render(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> std::result::Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = attributes
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingAttribute(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}
