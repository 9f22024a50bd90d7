//! The connection supervisor: one TCP session per iteration, five
//! cooperating workers, failure-edge detection via [`wait_first`], ordered
//! teardown, and the reconnect sleep.

use crate::asyncutil::wait_first;
use crate::config::RoiConfig;
use crate::element::Element;
use crate::messenger::Messenger;
use crate::mqtt::{LivenessReceiver, MqttLiveness};
use crate::queue::{self, Item};
use crate::roi::{self, Memory};
use crate::xml::Decoder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Run TCP sessions against the ROI server until `shutdown` reads `true`.
/// `xml_to_forwarder` is the forwarder's half of the decoder's fan-out; it
/// lives across sessions for the whole process lifetime and is never
/// drained here.
pub async fn run(
    config: RoiConfig,
    templates_dir: PathBuf,
    mut liveness: LivenessReceiver,
    xml_to_forwarder: queue::Sender<Arc<Element>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut memory = Memory::default();

    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = wait_for_connected(&mut liveness) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            return;
        }

        match run_one_session(&config, &templates_dir, &xml_to_forwarder, &liveness, &mut memory)
            .await
        {
            Ok(()) => {}
            Err(err) => tracing::warn!(error = %err, "ROI session ended"),
        }

        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

async fn wait_for_connected(liveness: &mut LivenessReceiver) {
    while *liveness.borrow() != MqttLiveness::Connected {
        if liveness.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("tcp connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load ROI message templates: {0}")]
    Template(#[from] crate::messenger::TemplateError),
}

async fn run_one_session(
    config: &RoiConfig,
    templates_dir: &Path,
    xml_to_forwarder: &queue::Sender<Arc<Element>>,
    liveness: &LivenessReceiver,
    memory: &mut Memory,
) -> Result<(), SessionError> {
    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|source| SessionError::Connect {
            host: config.host.clone(),
            port: config.port,
            source,
        })?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(READ_CHUNK_SIZE, read_half);

    let (bytes_in_tx, bytes_in_rx) = queue::channel::<Vec<u8>>();
    let (xml_to_machine_tx, xml_to_machine_rx) = queue::channel::<Arc<Element>>();
    let (bytes_out_tx, bytes_out_rx) = queue::channel::<Vec<u8>>();
    let (memory_tx, memory_rx) = tokio::sync::oneshot::channel::<Memory>();

    let messenger = Messenger::load(templates_dir, &config.templates, bytes_out_tx.clone())?;

    let mut watch_for_disconnect = liveness.clone();
    let mut mqtt_disconnected_watch: JoinHandle<()> = tokio::spawn(async move {
        while *watch_for_disconnect.borrow() != MqttLiveness::Disconnected {
            if watch_for_disconnect.changed().await.is_err() {
                return;
            }
        }
    });

    let reader_bytes_in_tx = bytes_in_tx.clone();
    let mut reader_loop: JoinHandle<()> = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::info!("ROI server closed the connection");
                    return;
                }
                Ok(n) => queue::send_data(&reader_bytes_in_tx, buf[..n].to_vec()),
                Err(err) => {
                    tracing::warn!(error = %err, "error reading from the ROI socket");
                    return;
                }
            }
        }
    });

    let decoder_machine_tx = xml_to_machine_tx.clone();
    let decoder = Decoder::new(bytes_in_rx, decoder_machine_tx, xml_to_forwarder.clone());
    let mut decoder_loop: JoinHandle<()> = tokio::spawn(async move {
        if let Err(err) = decoder.keep_parsing().await {
            tracing::warn!(error = %err, "ROI XML stream failed to parse");
        }
    });

    let mut session_memory = memory.clone();
    let mut state_machine_loop: JoinHandle<()> = tokio::spawn(async move {
        if let Err(err) =
            roi::run_state_machine(xml_to_machine_rx, &messenger, &mut session_memory).await
        {
            tracing::warn!(error = %err, "ROI state machine failed");
        }
        let _ = memory_tx.send(session_memory);
    });

    let mut writer_bytes_out_rx = bytes_out_rx;
    let mut writer_loop: JoinHandle<()> = tokio::spawn(async move {
        loop {
            match writer_bytes_out_rx.recv().await {
                Some(Item::Data(bytes)) => {
                    if let Err(err) = write_half.write_all(&bytes).await {
                        tracing::warn!(error = %err, "error writing to the ROI socket");
                        return;
                    }
                    if let Err(err) = write_half.flush().await {
                        tracing::warn!(error = %err, "error flushing the ROI socket");
                        return;
                    }
                }
                Some(Item::Close) | None => return,
            }
        }
    });

    let (index, _result) = wait_first(vec![
        &mut mqtt_disconnected_watch,
        &mut reader_loop,
        &mut decoder_loop,
        &mut writer_loop,
        &mut state_machine_loop,
    ])
    .await;
    tracing::debug!(
        worker_index = index,
        "ROI session worker finished first, tearing down"
    );

    // Ordered teardown (§4.7): each step reclaims one queue before moving
    // to the next, regardless of which of the five workers lost the race.
    mqtt_disconnected_watch.abort();

    reader_loop.abort();
    let _ = reader_loop.await;

    queue::send_close(&bytes_in_tx);
    let _ = decoder_loop.await;

    queue::send_close(&xml_to_machine_tx);
    let _ = state_machine_loop.await;
    if let Ok(updated) = memory_rx.await {
        *memory = updated;
    }

    queue::send_close(&bytes_out_tx);
    let _ = writer_loop.await;

    // The receivers for bytes_in, xml_to_machine, and bytes_out were each
    // owned by the task that has just joined above; dropping that task
    // already dropped its receiver, so nothing is left to drain on this
    // side. `xml_to_forwarder` is deliberately left untouched: it outlives
    // this TCP session.

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoiTemplates, TemplateConfig};
    use crate::mqtt::{liveness_channel, MqttLiveness};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;

    fn tempdir() -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "roi-mqtt-bridge-supervisor-test-{}-{}",
            std::process::id(),
            fastrand::u64(..)
        ));
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn template_config(filename: &str) -> TemplateConfig {
        TemplateConfig {
            filename: filename.to_string(),
            mapping: BTreeMap::new(),
        }
    }

    fn roi_config(dir: &Path, host: String, port: u16) -> RoiConfig {
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

        RoiConfig {
            host,
            port,
            reconnect_interval: std::time::Duration::from_millis(10),
            templates: RoiTemplates {
                own_root_start_tag: template_config("start.xml"),
                own_root_end_tag: template_config("end.xml"),
                subscribe: template_config("sub.xml"),
                resume_subscription: template_config("resume.xml"),
                last_processed: template_config("lp.xml"),
            },
        }
    }

    /// Scenario 6 from SPEC_FULL.md §8: the server closes the connection
    /// after a normal subscribe exchange; teardown must run to completion
    /// and `run_one_session` must return without hanging.
    #[tokio::test]
    async fn server_eof_tears_down_the_session_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(
                    br#"<FromPubTransMessages xmlns="http://www.pubtrans.com/ROI/3.0">"#,
                )
                .await
                .unwrap();
            // Drain whatever the client sends (root start tag, then Subscribe).
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(br#"<SubscriptionResponse MessageId="1"/>"#)
                .await
                .unwrap();
            // Dropping the socket here is the EOF the client's reader task
            // observes; the client never needs to send anything else once
            // it reaches `Listening`, so there is nothing more to drain.
        });

        let dir = tempdir();
        let config = roi_config(&dir, addr.ip().to_string(), addr.port());
        let (xml_to_forwarder_tx, mut xml_to_forwarder_rx) = queue::channel::<Arc<Element>>();
        let (liveness_tx, liveness_rx) = liveness_channel();
        liveness_tx.send(MqttLiveness::Connected).unwrap();
        // Force the subscribe branch (rather than the should_resume-true
        // default's resume branch) so the fake server's `SubscriptionResponse`
        // below is the reply the state machine actually expects.
        let mut memory = crate::roi::Memory {
            should_resume: false,
            last_on_message_id: None,
        };

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_one_session(&config, &dir, &xml_to_forwarder_tx, &liveness_rx, &mut memory),
        )
        .await
        .expect("run_one_session must return instead of hanging once the server closes");
        assert_matches!(result, Ok(()));
        assert!(memory.should_resume);

        let mut saw_root = false;
        while let Ok(Item::Data(element)) = xml_to_forwarder_rx.try_recv() {
            if element.name.local_name == crate::xml::ROOT_LOCAL_NAME {
                saw_root = true;
            }
        }
        assert!(saw_root, "the decoder must still fan the root out to the forwarder queue even though this TCP session is tearing down");

        server.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
