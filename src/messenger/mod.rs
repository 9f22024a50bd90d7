mod messenger;
mod templater;

pub use messenger::Messenger;
pub use templater::{MessageIdCounter, TemplateError, Templater};
