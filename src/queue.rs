//! The four FIFO channels that wire the protocol engine together, and the
//! poison-pill item type every consumer must respect.

use tokio::sync::mpsc;

/// An item carried on one of the protocol-engine queues.
///
/// Replaces the original implementation's in-band sentinel value (a single
/// module-level object compared by identity against otherwise-typed
/// payloads) with an explicit sum type: a consumer can never mistake `Close`
/// for data, and the compiler enforces that every consumer handles it.
#[derive(Debug, Clone)]
pub enum Item<T> {
    Data(T),
    Close,
}

impl<T> Item<T> {
    pub fn into_data(self) -> Option<T> {
        match self {
            Item::Data(value) => Some(value),
            Item::Close => None,
        }
    }
}

/// Unbounded sender half, paired with [`Receiver`].
pub type Sender<T> = mpsc::UnboundedSender<Item<T>>;
/// Unbounded receiver half.
pub type Receiver<T> = mpsc::UnboundedReceiver<Item<T>>;

/// Create a new unbounded poison-pill queue.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    mpsc::unbounded_channel()
}

/// Send a data item, logging (not panicking) if the consumer has gone away.
///
/// By the time this happens the consuming task is already tearing down, so
/// a dropped send is expected, not exceptional.
pub fn send_data<T>(sender: &Sender<T>, value: T) {
    if sender.send(Item::Data(value)).is_err() {
        tracing::debug!("send on a queue whose consumer has already exited");
    }
}

/// Place the poison pill on the queue, unblocking its consumer.
pub fn send_close<T>(sender: &Sender<T>) {
    if sender.send(Item::Close).is_err() {
        tracing::debug!("close sentinel sent to a queue whose consumer has already exited");
    }
}

/// Drain whatever is currently buffered, assuming no one else is producing.
pub async fn drain<T>(receiver: &mut Receiver<T>) {
    while receiver.try_recv().is_ok() {}
}
