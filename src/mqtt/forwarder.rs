//! Owns the single MQTT client for the process lifetime: probes for an
//! existing retained root tag, publishes it (once) if absent, then forwards
//! every subsequent decoded element as a non-retained publish.

use super::liveness::{LivenessSender, MqttLiveness};
use crate::config::MqttConfig;
use crate::element::Element;
use crate::queue::{Item, Receiver};
use crate::xml::{ROOT_LOCAL_NAME, ROOT_NAMESPACE};
use quick_xml::events::{BytesStart, Event};
use rumqttc::{
    AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport as RumqttcTransport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MqttForwarderError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("cannot read TLS CA bundle {path:?}: {source}")]
    CaCert {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const RETAINED_PROBE_CLIENT_SUFFIX: &str = "-retained-probe";

fn is_root(element: &Element) -> bool {
    element.name.namespace.as_deref() == Some(ROOT_NAMESPACE)
        && element.name.local_name == ROOT_LOCAL_NAME
}

fn mqtt_options(config: &MqttConfig, client_id: &str) -> Result<MqttOptions, MqttForwarderError> {
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    if matches!(config.transport, crate::config::Transport::Tls) {
        options.set_transport(tls_transport(config.ca_certs_path.as_deref())?);
    }
    Ok(options)
}

/// The default transport trusts the platform's native root store; a
/// configured `ca_certs_path` overrides that with a single PEM bundle, the
/// idiomatic-Rust analogue of the original's `paho-mqtt` `ca_certs` option.
fn tls_transport(ca_certs_path: Option<&Path>) -> Result<RumqttcTransport, MqttForwarderError> {
    match ca_certs_path {
        Some(path) => {
            let ca = std::fs::read(path).map_err(|source| MqttForwarderError::CaCert {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(RumqttcTransport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }))
        }
        None => Ok(RumqttcTransport::tls_with_default_config()),
    }
}

/// Probe the topic for an existing retained message using a separate,
/// short-lived client so the main session never risks mistaking a stray
/// retained publish from its own earlier incarnation for the answer.
///
/// The probe's client id is the configured one plus a fixed suffix: sharing
/// the configured id here would let the broker treat this connect as a
/// session takeover of whatever is about to become the main connection,
/// racing its own disconnect against the main connect.
async fn root_already_published(config: &MqttConfig) -> Result<bool, MqttForwarderError> {
    let probe_client_id = format!("{}{}", config.client_id, RETAINED_PROBE_CLIENT_SUFFIX);
    let options = mqtt_options(config, &probe_client_id)?;
    let (client, mut event_loop) = AsyncClient::new(options, 16);
    client.subscribe(&config.topic, config.qos.into()).await?;

    let deadline = tokio::time::sleep(config.retained_message_wait_duration);
    tokio::pin!(deadline);

    let published = loop {
        tokio::select! {
            _ = &mut deadline => break false,
            event = event_loop.poll() => match event {
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) if publish.retain => {
                    break first_tag_is_root(&publish.payload);
                }
                Ok(_) => continue,
                Err(err) => return Err(err.into()),
            },
        }
    };

    client.unsubscribe(&config.topic).await.ok();
    client.disconnect().await.ok();
    Ok(published)
}

fn first_tag_is_root(payload: &[u8]) -> bool {
    let mut reader = quick_xml::Reader::from_reader(payload);
    let mut scratch = Vec::new();
    loop {
        match reader.read_event_into(&mut scratch) {
            Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                return qualified_name_is_root(&start);
            }
            Ok(Event::Eof) => return false,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}

fn qualified_name_is_root(start: &BytesStart<'_>) -> bool {
    let local = String::from_utf8_lossy(start.name().local_name().as_ref()).into_owned();
    local == ROOT_LOCAL_NAME
}

/// The bytes to publish for `element`: the exact wire bytes the decoder
/// captured, not a re-encoding through `quick_xml::Writer`. This is what
/// keeps namespace prefixes (including the root's `xmlns` declaration)
/// verbatim — re-serializing from the parsed `name`/`attributes` alone would
/// need a namespace resolver this decoder never builds, since it matches
/// children by local name only (see `xml::decoder::resolve_qname`).
fn serialize(element: &Element) -> Vec<u8> {
    element.raw.clone()
}

/// Strip a trailing `</prefix:local>` (or `</local>`) close tag, if present,
/// so the republished root stays open-ended for subscribers.
fn strip_end_tag(mut bytes: Vec<u8>, local_name: &str) -> Vec<u8> {
    let needle = format!("</{local_name}>");
    if let Some(prefixed_end) = find_prefixed_end_tag(&bytes, local_name) {
        bytes.truncate(prefixed_end);
        return bytes;
    }
    if bytes.ends_with(needle.as_bytes()) {
        bytes.truncate(bytes.len() - needle.len());
    }
    bytes
}

fn find_prefixed_end_tag(bytes: &[u8], local_name: &str) -> Option<usize> {
    let haystack = String::from_utf8_lossy(bytes);
    let suffix = format!(":{local_name}>");
    let close_start = haystack.rfind("</")?;
    let tail = &haystack[close_start..];
    if tail.ends_with(&suffix) || tail.ends_with(&format!("</{local_name}>")) {
        Some(close_start)
    } else {
        None
    }
}

/// Run the forwarder for the whole process lifetime. Connects, publishes
/// the retained root once if needed, then republishes every subsequent
/// decoded element non-retained.
pub async fn run_forwarder(
    config: MqttConfig,
    mut xml_to_forwarder: Receiver<Arc<Element>>,
    liveness_tx: LivenessSender,
) -> Result<(), MqttForwarderError> {
    let mut root_published = root_already_published(&config).await.unwrap_or_else(|err| {
        tracing::warn!(error = %err, "retained-message probe failed, assuming root not yet published");
        false
    });

    let options = mqtt_options(&config, &config.client_id)?;
    let (client, mut event_loop) = AsyncClient::new(options, 64);

    let poll_liveness = liveness_tx.clone();
    let poll_handle = tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) if ack.code == rumqttc::ConnectReturnCode::Success => {
                    let _ = poll_liveness.send(MqttLiveness::Connected);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "mqtt event loop error");
                    let _ = poll_liveness.send(MqttLiveness::Disconnected);
                }
            }
        }
    });

    if !root_published {
        loop {
            match xml_to_forwarder.recv().await {
                Some(Item::Data(element)) if is_root(&element) => {
                    let bytes = strip_end_tag(serialize(&element), &element.name.local_name);
                    client
                        .publish(&config.topic, config.qos.into(), true, bytes)
                        .await?;
                    root_published = true;
                    break;
                }
                Some(Item::Data(_)) => {
                    tracing::warn!("dropping non-root element received before the root was published");
                }
                Some(Item::Close) | None => {
                    poll_handle.abort();
                    return Ok(());
                }
            }
        }
    }

    loop {
        match xml_to_forwarder.recv().await {
            Some(Item::Data(element)) if is_root(&element) => {
                tracing::debug!("dropping a redelivered root element, already published once");
            }
            Some(Item::Data(element)) => {
                let bytes = serialize(&element);
                if let Err(err) = client
                    .try_publish(&config.topic, QoS::from(config.qos), false, bytes)
                {
                    tracing::warn!(error = %err, "failed to publish element");
                }
            }
            Some(Item::Close) | None => {
                poll_handle.abort();
                return Ok(());
            }
        }
    }
}
