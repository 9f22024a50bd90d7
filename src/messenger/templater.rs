//! Renders outbound XML fragments from static templates plus a shared
//! monotonic message-id counter.

use crate::config::TemplateConfig;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("cannot read template file {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template {filename:?} has an unresolved placeholder: {placeholder}")]
    UnresolvedPlaceholder { filename: String, placeholder: String },
}

/// The process-wide message-id sequence. Holes are permitted, uniqueness is
/// required, so a plain relaxed-ordering counter is enough.
#[derive(Debug, Default)]
pub struct MessageIdCounter(AtomicU64);

impl MessageIdCounter {
    pub fn new() -> Arc<MessageIdCounter> {
        Arc::new(MessageIdCounter(AtomicU64::new(0)))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Fills out one ROI message template from a `${name}`-style template file.
pub struct Templater {
    filename: String,
    template: String,
    defaults: BTreeMap<String, String>,
    counter: Arc<MessageIdCounter>,
}

impl Templater {
    /// Load a template from `templates_dir/config.filename`.
    pub fn load(
        templates_dir: &Path,
        config: &TemplateConfig,
        counter: Arc<MessageIdCounter>,
    ) -> Result<Templater, TemplateError> {
        let path = templates_dir.join(&config.filename);
        let template =
            std::fs::read_to_string(&path).map_err(|source| TemplateError::Io { path, source })?;
        Ok(Templater {
            filename: config.filename.clone(),
            template,
            defaults: config.mapping.clone(),
            counter,
        })
    }

    /// Substitute placeholders using `defaults ∪ extra ∪ {message_id}`.
    /// `message_id` always comes from the shared counter, regardless of what
    /// `extra` contains.
    pub fn fill(
        &self,
        extra_mapping: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, TemplateError> {
        let mut mapping = self.defaults.clone();
        mapping.extend(extra_mapping.clone());
        mapping.insert("message_id".to_string(), self.counter.next().to_string());

        let rendered = substitute(&self.template, &mapping).map_err(|placeholder| {
            TemplateError::UnresolvedPlaceholder {
                filename: self.filename.clone(),
                placeholder,
            }
        })?;
        Ok(rendered.into_bytes())
    }
}

/// Replace every `${name}` occurrence in `template` using `mapping`.
/// Returns the unresolved placeholder name as the error case.
fn substitute(template: &str, mapping: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| "unterminated ${ placeholder".to_string())?;
        let name = &after[..end];
        let value = mapping.get(name).ok_or_else(|| name.to_string())?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
