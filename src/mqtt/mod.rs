mod forwarder;
mod liveness;

pub use forwarder::{run_forwarder, MqttForwarderError};
pub use liveness::{liveness_channel, LivenessReceiver, LivenessSender, MqttLiveness};
