//! A single atomic signal replacing the original's twin connect/disconnect
//! events: exactly one of `Connected`/`Disconnected` holds at any time, and
//! `tokio::sync::watch` guarantees an observer never sees a stale value once
//! `changed()` resolves.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttLiveness {
    Disconnected,
    Connected,
}

pub type LivenessSender = watch::Sender<MqttLiveness>;
pub type LivenessReceiver = watch::Receiver<MqttLiveness>;

pub fn liveness_channel() -> (LivenessSender, LivenessReceiver) {
    watch::channel(MqttLiveness::Disconnected)
}
