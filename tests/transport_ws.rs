//! Integration tests for the streaming transport
//!
//! These spin up an in-process WebSocket server and drive the real
//! `TransportChannel` against it: connect/ack flow, inbound dispatch,
//! reconnection with backoff, and the batch dispatch path end to end.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use voicewire::{
    AudioFormat, CancelResponse, CaptureEvent, ClientEvent, ConnectionState, CreateResponse,
    DispatchMode, EventChannel, FileSubmitter, OutboundMessage, ReconnectPolicy,
    RecordingBuffer, SessionController, Settings, SettingsPatch, StatusResponse, SubmitError,
    SubmitOptions, TranscriptionApi, TransportChannel,
};

/// Subscribe to one event name and collect every delivery.
fn record(events: &EventChannel, name: &'static str) -> Arc<Mutex<Vec<ClientEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    events.subscribe(name, move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    log
}

/// Poll `cond` until it holds or five seconds pass.
async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(50),
        backoff_factor: 2.0,
        max_attempts: 3,
    }
}

#[tokio::test]
async fn integration_connect_send_and_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::channel::<String>(8);

    // Echo server: hello on open, one transcription per received frame.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"connection","client_id":"c-1"}"#.to_string(),
        ))
        .await
        .unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                frame_tx.send(text).await.unwrap();
                ws.send(Message::Text(
                    r#"{"type":"transcription","text":"hi there","language":"en","processing_time":0.2,"timestamp":1.0}"#
                        .to_string(),
                ))
                .await
                .unwrap();
            }
        }
    });

    let events = Arc::new(EventChannel::new());
    let connected = record(&events, "connected");
    let transcripts = record(&events, "transcription");

    let channel = TransportChannel::new(events.clone());
    channel.connect(&format!("ws://{}", addr));

    assert!(wait_until(|| !connected.lock().unwrap().is_empty()).await);
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(connected.lock().unwrap().len(), 1);

    channel
        .send(&OutboundMessage::config(&Settings::default()))
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(3), frame_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(frame.contains("\"type\":\"config\""));
    assert!(frame.contains("\"model\":\"base\""));

    assert!(wait_until(|| !transcripts.lock().unwrap().is_empty()).await);
    match &transcripts.lock().unwrap()[0] {
        ClientEvent::Transcription(result) => {
            assert_eq!(result.text, "hi there");
            assert_eq!(result.language_detected, Some("en".to_string()));
        }
        other => panic!("expected transcription event, got {:?}", other),
    }

    channel.disconnect();
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert!(matches!(
        channel.send(&OutboundMessage::ping()),
        Err(voicewire::TransportError::NotConnected)
    ));
}

#[tokio::test]
async fn integration_unintentional_drop_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));

    let server_accepted = accepted.clone();
    tokio::spawn(async move {
        // First connection closes immediately: an unintentional drop from
        // the client's point of view.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        server_accepted.fetch_add(1, Ordering::SeqCst);
        let _ = ws.close(None).await;

        // Second connection stays open.
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        server_accepted.fetch_add(1, Ordering::SeqCst);
        let (_write, mut read) = ws.split();
        while let Some(Ok(_)) = read.next().await {}
    });

    let events = Arc::new(EventChannel::new());
    let reconnecting = record(&events, "reconnecting");

    let channel = TransportChannel::with_policy(events.clone(), fast_policy());
    channel.connect(&format!("ws://{}", addr));

    assert!(
        wait_until(|| {
            accepted.load(Ordering::SeqCst) == 2
                && channel.state() == ConnectionState::Connected
        })
        .await
    );

    // Exactly one retry was needed, at the base delay.
    let reconnecting = reconnecting.lock().unwrap();
    assert_eq!(reconnecting.len(), 1);
    assert!(matches!(
        reconnecting[0],
        ClientEvent::Reconnecting {
            attempt: 1,
            delay_ms: 50
        }
    ));

    channel.disconnect();
}

#[tokio::test]
async fn integration_reconnect_exhaustion_backs_off_then_disconnects() {
    // Grab a port with nothing listening on it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let events = Arc::new(EventChannel::new());
    let reconnecting = record(&events, "reconnecting");
    let errors = record(&events, "error");

    let channel = TransportChannel::with_policy(events.clone(), fast_policy());
    channel.connect(&format!("ws://{}", addr));

    assert!(
        wait_until(|| {
            channel.state() == ConnectionState::Disconnected
                && !errors.lock().unwrap().is_empty()
        })
        .await
    );

    // Delays follow base * factor^(n-1) for attempts 1..max_attempts.
    let delays: Vec<u64> = reconnecting
        .lock()
        .unwrap()
        .iter()
        .map(|event| match event {
            ClientEvent::Reconnecting { delay_ms, .. } => *delay_ms,
            other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert_eq!(delays, vec![50, 100, 200]);

    match &errors.lock().unwrap()[0] {
        ClientEvent::Error { message } => assert!(message.contains("exhausted")),
        other => panic!("expected error event, got {:?}", other),
    };
}

#[tokio::test]
#[ignore] // Requires a running transcription server
async fn integration_live_server_connects_and_acks_config() {
    let endpoint = std::env::var("VOICEWIRE_WS_URL")
        .unwrap_or_else(|_| "ws://localhost:8000/ws/transcribe".to_string());

    let events = Arc::new(EventChannel::new());
    let config_acks = record(&events, "config");

    let channel = TransportChannel::new(events.clone());
    channel.connect(&endpoint);

    assert!(wait_until(|| channel.state() == ConnectionState::Connected).await);
    channel
        .send(&OutboundMessage::config(&Settings::default()))
        .unwrap();

    assert!(wait_until(|| !config_acks.lock().unwrap().is_empty()).await);
    channel.disconnect();
}

/// HTTP fallback stand-in that must never be reached while connected.
struct UnreachableApi {
    calls: AtomicU32,
}

#[async_trait]
impl TranscriptionApi for UnreachableApi {
    async fn create_request(
        &self,
        _file_name: &str,
        _bytes: Vec<u8>,
        _options: &SubmitOptions,
    ) -> Result<CreateResponse, SubmitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SubmitError::SubmitFailed("unreachable".to_string()))
    }

    async fn fetch_status(&self, _request_id: &str) -> Result<StatusResponse, SubmitError> {
        Err(SubmitError::SubmitFailed("unreachable".to_string()))
    }

    async fn cancel_request(&self, _request_id: &str) -> Result<CancelResponse, SubmitError> {
        Err(SubmitError::SubmitFailed("unreachable".to_string()))
    }
}

#[tokio::test]
async fn integration_batch_stop_sends_single_audio_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::channel::<String>(8);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                frame_tx.send(text).await.unwrap();
            }
        }
    });

    let events = Arc::new(EventChannel::new());
    let transport = Arc::new(TransportChannel::new(events.clone()));
    transport.connect(&format!("ws://{}", addr));
    assert!(wait_until(|| transport.state() == ConnectionState::Connected).await);

    let api = Arc::new(UnreachableApi {
        calls: AtomicU32::new(0),
    });
    let submitter = Arc::new(FileSubmitter::new(api.clone(), events.clone()));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(voicewire::JsonFileStore::new(dir.path().join("settings.json")));

    let session = SessionController::new(events, transport.clone(), submitter, store);
    session
        .update_settings(&SettingsPatch {
            mode: Some(DispatchMode::Batch),
            ..Default::default()
        })
        .unwrap();

    // Drain the config frame pushed by the settings update.
    let config_frame = tokio::time::timeout(Duration::from_secs(3), frame_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(config_frame.contains("\"type\":\"config\""));

    // Three seconds of accumulated recording, stopped: exactly one audio
    // frame, tagged with the probed format, and no fallback call.
    session
        .route_capture_event(CaptureEvent::Finished(RecordingBuffer {
            data: vec![0u8; 4096],
            format: AudioFormat::Wav,
            duration_secs: 3.0,
            chunk_count: 0,
        }))
        .await;

    let audio_frame = tokio::time::timeout(Duration::from_secs(3), frame_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(audio_frame.contains("\"type\":\"audio\""));
    assert!(audio_frame.contains("\"format\":\"wav\""));
    assert!(audio_frame.contains("\"model\":\"base\""));

    assert!(frame_rx.try_recv().is_err());
    assert_eq!(api.calls.load(Ordering::SeqCst), 0);

    transport.disconnect();
}
