//! Typed outbound operations for the ROI protocol, backed by one
//! [`Templater`] per message kind and a shared [`MessageIdCounter`].

use super::templater::{MessageIdCounter, TemplateError, Templater};
use crate::config::RoiTemplates;
use crate::queue;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// The five outbound ROI messages the state machine can ask for.
///
/// Owns no network resources itself: every operation renders bytes through
/// a Templater and enqueues them onto `bytes_out` for the writer task.
pub struct Messenger {
    bytes_out: queue::Sender<Vec<u8>>,
    own_root_start_tag: Templater,
    own_root_end_tag: Templater,
    subscribe: Templater,
    resume_subscription: Templater,
    last_processed: Templater,
}

impl Messenger {
    pub fn load(
        templates_dir: &Path,
        config: &RoiTemplates,
        bytes_out: queue::Sender<Vec<u8>>,
    ) -> Result<Messenger, TemplateError> {
        let counter = MessageIdCounter::new();
        Ok(Messenger {
            bytes_out,
            own_root_start_tag: Templater::load(
                templates_dir,
                &config.own_root_start_tag,
                Arc::clone(&counter),
            )?,
            own_root_end_tag: Templater::load(
                templates_dir,
                &config.own_root_end_tag,
                Arc::clone(&counter),
            )?,
            subscribe: Templater::load(templates_dir, &config.subscribe, Arc::clone(&counter))?,
            resume_subscription: Templater::load(
                templates_dir,
                &config.resume_subscription,
                Arc::clone(&counter),
            )?,
            last_processed: Templater::load(
                templates_dir,
                &config.last_processed,
                Arc::clone(&counter),
            )?,
        })
    }

    pub fn send_own_root_start_tag(&self) -> Result<(), TemplateError> {
        self.enqueue(&self.own_root_start_tag, &BTreeMap::new())
    }

    pub fn send_own_root_end_tag(&self) -> Result<(), TemplateError> {
        self.enqueue(&self.own_root_end_tag, &BTreeMap::new())
    }

    pub fn send_subscribe(&self) -> Result<(), TemplateError> {
        self.enqueue(&self.subscribe, &BTreeMap::new())
    }

    pub fn send_resume_subscription(&self) -> Result<(), TemplateError> {
        self.enqueue(&self.resume_subscription, &BTreeMap::new())
    }

    /// Reply to a `LastProcessedMessageRequest`. `on_message_id` is the id
    /// we are replying to; `last_processed_message_id` is the id we claim to
    /// have last processed (per §4.5, always equal to `on_message_id` here).
    pub fn send_last_processed(
        &self,
        on_message_id: &str,
        last_processed_message_id: &str,
    ) -> Result<(), TemplateError> {
        let mut mapping = BTreeMap::new();
        mapping.insert("on_message_id".to_string(), on_message_id.to_string());
        mapping.insert(
            "last_processed_message_id".to_string(),
            last_processed_message_id.to_string(),
        );
        self.enqueue(&self.last_processed, &mapping)
    }

    fn enqueue(
        &self,
        templater: &Templater,
        extra_mapping: &BTreeMap<String, String>,
    ) -> Result<(), TemplateError> {
        let bytes = templater.fill(extra_mapping)?;
        queue::send_data(&self.bytes_out, bytes);
        Ok(())
    }
}
