//! The ROI subscription protocol, modeled as a closed sum of states and a
//! pure transition function. No callbacks, no `Drop`-triggered side effects:
//! every action the machine takes is returned from `step` and performed by
//! its caller.

use crate::element::Element;
use crate::messenger::{Messenger, TemplateError};
use crate::queue::{Item, Receiver};
use crate::xml::{ROOT_LOCAL_NAME, ROOT_NAMESPACE};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("failed to render an outbound message: {0}")]
    Template(#[from] TemplateError),
}

/// Where control returns to after answering a `LastProcessedMessageRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumed {
    Listening,
    ResumingResponse,
    SubscribingResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoiState {
    ReadyToStart,
    OwnRootTag,
    RemoteRootTag,
    SubscriptionChoice,
    ResumingAttempt,
    ResumingResponse,
    SubscribingAttempt,
    SubscribingResponse,
    LastProcessed(Resumed),
    Listening,
    Closing,
    Closed,
}

/// One decoded input to the machine: either an element off `xml_to_machine`,
/// or the start-of-session pulse the supervisor provides once per TCP
/// connection.
pub enum Input {
    Start,
    Element(Arc<Element>),
    Close,
}

/// The Messenger call (if any) a transition requires, expressed as data so
/// `step` stays a pure function; the caller performs the actual send.
pub enum Action {
    None,
    SendOwnRootStartTag,
    SendOwnRootEndTag,
    SendSubscribe,
    SendResumeSubscription,
    SendLastProcessed { on_message_id: String },
}

/// Subscription state carried across reconnects by the caller and threaded
/// back into `step` on every call.
#[derive(Debug, Clone)]
pub struct Memory {
    pub should_resume: bool,
    pub last_on_message_id: Option<String>,
}

impl Default for Memory {
    fn default() -> Memory {
        Memory {
            should_resume: true,
            last_on_message_id: None,
        }
    }
}

const UNKNOWN_MESSAGE_ID: &str = "<unknown>";

fn is_root(element: &Element) -> bool {
    element.name.namespace.as_deref() == Some(ROOT_NAMESPACE)
        && element.name.local_name == ROOT_LOCAL_NAME
}

fn local_name_is(element: &Element, local_name: &str) -> bool {
    element.name.local_name == local_name
}

/// Advance the machine by one input. Returns the action to perform and the
/// next state; `memory` is mutated in place to reflect any state the spec
/// tracks across reconnects (`should_resume`, `last_on_message_id`).
pub fn step(state: RoiState, input: Input, memory: &mut Memory) -> (Action, RoiState) {
    match (state, input) {
        (RoiState::ReadyToStart, Input::Start) => (Action::None, RoiState::OwnRootTag),

        (RoiState::OwnRootTag, _) => (Action::SendOwnRootStartTag, RoiState::RemoteRootTag),

        (RoiState::RemoteRootTag, Input::Element(element)) if is_root(&element) => {
            (Action::None, RoiState::SubscriptionChoice)
        }
        (RoiState::RemoteRootTag, Input::Close) => (Action::None, RoiState::Closing),
        (RoiState::RemoteRootTag, Input::Element(_)) => (Action::None, RoiState::Closing),

        (RoiState::SubscriptionChoice, _) if memory.should_resume => {
            (Action::None, RoiState::ResumingAttempt)
        }
        (RoiState::SubscriptionChoice, _) => (Action::None, RoiState::SubscribingAttempt),

        (RoiState::ResumingAttempt, _) => {
            (Action::SendResumeSubscription, RoiState::ResumingResponse)
        }
        (RoiState::SubscribingAttempt, _) => (Action::SendSubscribe, RoiState::SubscribingResponse),

        (RoiState::ResumingResponse, Input::Close) => (Action::None, RoiState::Closing),
        (RoiState::ResumingResponse, Input::Element(element)) => {
            if local_name_is(&element, "SubscriptionResumeResponse") {
                (Action::None, RoiState::Listening)
            } else if local_name_is(&element, "LastProcessedMessageRequest") {
                remember_message_id(&element, memory);
                (
                    reply_action(memory),
                    RoiState::LastProcessed(Resumed::ResumingResponse),
                )
            } else if local_name_is(&element, "SubscriptionErrorReport")
                && element.attribute("Code") == Some("122")
            {
                (Action::None, RoiState::ResumingResponse)
            } else if local_name_is(&element, "SubscriptionErrorReport")
                || local_name_is(&element, "SubscriptionErrorResponse")
            {
                memory.should_resume = false;
                (Action::None, RoiState::Closing)
            } else {
                (Action::None, RoiState::Closing)
            }
        }

        (RoiState::SubscribingResponse, Input::Close) => (Action::None, RoiState::Closing),
        (RoiState::SubscribingResponse, Input::Element(element)) => {
            if local_name_is(&element, "SubscriptionResponse") {
                memory.should_resume = true;
                (Action::None, RoiState::Listening)
            } else if local_name_is(&element, "LastProcessedMessageRequest") {
                remember_message_id(&element, memory);
                memory.should_resume = true;
                (
                    reply_action(memory),
                    RoiState::LastProcessed(Resumed::SubscribingResponse),
                )
            } else {
                memory.should_resume = true;
                (Action::None, RoiState::Closing)
            }
        }

        (RoiState::LastProcessed(resumed), _) => {
            let next = match resumed {
                Resumed::Listening => RoiState::Listening,
                Resumed::ResumingResponse => RoiState::ResumingResponse,
                Resumed::SubscribingResponse => RoiState::SubscribingResponse,
            };
            (Action::None, next)
        }

        (RoiState::Listening, Input::Close) => (Action::None, RoiState::Closing),
        (RoiState::Listening, Input::Element(element)) => {
            if local_name_is(&element, "LastProcessedMessageRequest") {
                remember_message_id(&element, memory);
                (
                    reply_action(memory),
                    RoiState::LastProcessed(Resumed::Listening),
                )
            } else if is_root(&element) {
                (Action::None, RoiState::Closing)
            } else {
                (Action::None, RoiState::Listening)
            }
        }

        (RoiState::Closing, _) => (Action::SendOwnRootEndTag, RoiState::Closed),
        (RoiState::Closed, _) => (Action::None, RoiState::Closed),

        // Any other (state, input) combination not named above is an input
        // arriving in a state where only the entry action matters (e.g. the
        // synthetic `Start`/close-sentinel pulses used to drive entry-only
        // states); treat it as a no-op stay rather than panicking.
        (state, _) => (Action::None, state),
    }
}

fn remember_message_id(element: &Element, memory: &mut Memory) {
    match element.attribute("MessageId") {
        Some(id) => memory.last_on_message_id = Some(id.to_string()),
        None => tracing::warn!("LastProcessedMessageRequest without a MessageId attribute"),
    }
}

fn reply_action(memory: &Memory) -> Action {
    let on_message_id = memory.last_on_message_id.clone().unwrap_or_else(|| {
        tracing::warn!(
            "replying to LastProcessedMessageRequest before any MessageId has been observed"
        );
        UNKNOWN_MESSAGE_ID.to_string()
    });
    Action::SendLastProcessed { on_message_id }
}

fn perform(action: Action, messenger: &Messenger) -> Result<(), StateMachineError> {
    match action {
        Action::None => Ok(()),
        Action::SendOwnRootStartTag => Ok(messenger.send_own_root_start_tag()?),
        Action::SendOwnRootEndTag => Ok(messenger.send_own_root_end_tag()?),
        Action::SendSubscribe => Ok(messenger.send_subscribe()?),
        Action::SendResumeSubscription => Ok(messenger.send_resume_subscription()?),
        Action::SendLastProcessed { on_message_id } => {
            Ok(messenger.send_last_processed(&on_message_id, &on_message_id)?)
        }
    }
}

/// Drive the machine to `Closed`, reading inputs from `xml_to_machine` and
/// performing actions through `messenger`. `memory` persists across calls
/// (i.e. across TCP reconnects within one process).
pub async fn run_state_machine(
    mut xml_to_machine: Receiver<Arc<Element>>,
    messenger: &Messenger,
    memory: &mut Memory,
) -> Result<(), StateMachineError> {
    let mut state = RoiState::ReadyToStart;
    let (action, next) = step(state, Input::Start, memory);
    perform(action, messenger)?;
    state = next;

    // Entry-only states (`OwnRootTag`, `ResumingAttempt`, `SubscribingAttempt`,
    // `LastProcessed`, `Closing`) perform their action and advance without
    // consuming an input; drive through them before waiting on the channel.
    state = drain_entry_only_states(state, messenger, memory)?;

    while state != RoiState::Closed {
        let input = match xml_to_machine.recv().await {
            Some(Item::Data(element)) => Input::Element(element),
            Some(Item::Close) | None => Input::Close,
        };
        let (action, next) = step(state, input, memory);
        perform(action, messenger)?;
        state = next;
        state = drain_entry_only_states(state, messenger, memory)?;
    }
    Ok(())
}

/// `OwnRootTag`, `ResumingAttempt`, `SubscribingAttempt`, `LastProcessed`,
/// and `Closing` all perform their action on any input and leave immediately;
/// step them forward without blocking on a new channel read.
fn drain_entry_only_states(
    mut state: RoiState,
    messenger: &Messenger,
    memory: &mut Memory,
) -> Result<RoiState, StateMachineError> {
    loop {
        let is_entry_only = matches!(
            state,
            RoiState::OwnRootTag
                | RoiState::ResumingAttempt
                | RoiState::SubscribingAttempt
                | RoiState::LastProcessed(_)
                | RoiState::Closing
                | RoiState::SubscriptionChoice
        );
        if !is_entry_only {
            return Ok(state);
        }
        let (action, next) = step(state, Input::Close, memory);
        perform(action, messenger)?;
        state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoiTemplates, TemplateConfig};
    use crate::queue;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn template_config(filename: &str) -> TemplateConfig {
        TemplateConfig {
            filename: filename.to_string(),
            mapping: BTreeMap::new(),
        }
    }

    fn write_templates(dir: &Path) {
        std::fs::write(dir.join("start.xml"), "<Own MessageId=\"${message_id}\"/>").unwrap();
        std::fs::write(dir.join("end.xml"), "<OwnEnd MessageId=\"${message_id}\"/>").unwrap();
        std::fs::write(dir.join("sub.xml"), "<Subscribe MessageId=\"${message_id}\"/>").unwrap();
        std::fs::write(
            dir.join("resume.xml"),
            "<Resume MessageId=\"${message_id}\"/>",
        )
        .unwrap();
        std::fs::write(
            dir.join("lp.xml"),
            "<Reply On=\"${on_message_id}\" Last=\"${last_processed_message_id}\" MessageId=\"${message_id}\"/>",
        )
        .unwrap();
    }

    fn test_messenger(dir: &Path) -> (Messenger, queue::Receiver<Vec<u8>>) {
        let (tx, rx) = queue::channel::<Vec<u8>>();
        write_templates(dir);
        let templates = RoiTemplates {
            own_root_start_tag: template_config("start.xml"),
            own_root_end_tag: template_config("end.xml"),
            subscribe: template_config("sub.xml"),
            resume_subscription: template_config("resume.xml"),
            last_processed: template_config("lp.xml"),
        };
        let messenger = Messenger::load(dir, &templates, tx).unwrap();
        (messenger, rx)
    }

    fn root_element() -> Arc<Element> {
        Arc::new(Element {
            name: crate::element::QName::new(ROOT_NAMESPACE.to_string(), ROOT_LOCAL_NAME),
            attributes: vec![],
            text: String::new(),
            children: vec![],
            raw: vec![],
        })
    }

    fn child(local_name: &str, attrs: &[(&str, &str)]) -> Arc<Element> {
        Arc::new(Element {
            name: crate::element::QName::local(local_name.to_string()),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            text: String::new(),
            children: vec![],
            raw: vec![],
        })
    }

    fn tempdir() -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "roi-mqtt-bridge-state-machine-test-{}-{}",
            std::process::id(),
            fastrand::u64(..)
        ));
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn subscribe_happy_path_ends_listening_with_resume_true() {
        let dir = tempdir();
        let (messenger, _bytes_out) = test_messenger(&dir);
        let (elements_tx, elements_rx) = queue::channel::<Arc<Element>>();
        queue::send_data(&elements_tx, root_element());
        queue::send_data(&elements_tx, child("SubscriptionResponse", &[]));
        queue::send_close(&elements_tx);

        let mut memory = Memory {
            should_resume: false,
            last_on_message_id: None,
        };
        run_state_machine(elements_rx, &messenger, &mut memory)
            .await
            .unwrap();
        assert!(memory.should_resume);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn resume_rejected_closes_and_clears_should_resume() {
        let dir = tempdir();
        let (messenger, _bytes_out) = test_messenger(&dir);
        let (elements_tx, elements_rx) = queue::channel::<Arc<Element>>();
        queue::send_data(&elements_tx, root_element());
        queue::send_data(
            &elements_tx,
            child("SubscriptionErrorResponse", &[("Code", "200")]),
        );
        queue::send_close(&elements_tx);

        let mut memory = Memory {
            should_resume: true,
            last_on_message_id: None,
        };
        run_state_machine(elements_rx, &messenger, &mut memory)
            .await
            .unwrap();
        assert!(!memory.should_resume);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unexpected_other_element_during_resume_closes_without_touching_should_resume() {
        let dir = tempdir();
        let (messenger, _bytes_out) = test_messenger(&dir);
        let (elements_tx, elements_rx) = queue::channel::<Arc<Element>>();
        queue::send_data(&elements_tx, root_element());
        queue::send_data(&elements_tx, child("SomeUnexpectedElement", &[]));
        queue::send_close(&elements_tx);

        let mut memory = Memory {
            should_resume: true,
            last_on_message_id: None,
        };
        run_state_machine(elements_rx, &messenger, &mut memory)
            .await
            .unwrap();
        // Unlike an error report/response, an unrelated element during resume
        // leaves `should_resume` as the caller set it, so the next reconnect
        // still attempts a resume rather than falling back to subscribe.
        assert!(memory.should_resume);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn code_122_loops_until_the_real_response_arrives() {
        let dir = tempdir();
        let (messenger, _bytes_out) = test_messenger(&dir);
        let (elements_tx, elements_rx) = queue::channel::<Arc<Element>>();
        queue::send_data(&elements_tx, root_element());
        queue::send_data(
            &elements_tx,
            child("SubscriptionErrorReport", &[("Code", "122")]),
        );
        queue::send_data(&elements_tx, child("SubscriptionResumeResponse", &[]));
        queue::send_close(&elements_tx);

        let mut memory = Memory {
            should_resume: true,
            last_on_message_id: None,
        };
        run_state_machine(elements_rx, &messenger, &mut memory)
            .await
            .unwrap();
        assert!(memory.should_resume);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn last_processed_request_is_echoed_and_returns_to_listening() {
        let dir = tempdir();
        let (messenger, mut bytes_out) = test_messenger(&dir);
        let (elements_tx, elements_rx) = queue::channel::<Arc<Element>>();
        queue::send_data(&elements_tx, root_element());
        queue::send_data(&elements_tx, child("SubscriptionResponse", &[]));
        queue::send_data(
            &elements_tx,
            child("LastProcessedMessageRequest", &[("MessageId", "abc")]),
        );
        queue::send_close(&elements_tx);

        let mut memory = Memory {
            should_resume: false,
            last_on_message_id: None,
        };
        run_state_machine(elements_rx, &messenger, &mut memory)
            .await
            .unwrap();
        assert_eq!(memory.last_on_message_id.as_deref(), Some("abc"));

        let mut saw_reply = false;
        while let Ok(Item::Data(bytes)) = bytes_out.try_recv() {
            if String::from_utf8_lossy(&bytes).contains("On=\"abc\"") {
                saw_reply = true;
            }
        }
        assert!(saw_reply);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn close_reaches_closed_having_sent_the_end_tag() {
        let dir = tempdir();
        let (messenger, mut bytes_out) = test_messenger(&dir);
        let (elements_tx, elements_rx) = queue::channel::<Arc<Element>>();
        queue::send_close(&elements_tx);

        let mut memory = Memory::default();
        run_state_machine(elements_rx, &messenger, &mut memory)
            .await
            .unwrap();

        let mut sent_end_tag = false;
        while let Ok(Item::Data(bytes)) = bytes_out.try_recv() {
            if String::from_utf8_lossy(&bytes).starts_with("<OwnEnd") {
                sent_end_tag = true;
            }
        }
        assert!(sent_end_tag);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
