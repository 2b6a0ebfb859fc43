//! Live call integration tests over an in-memory agent

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use silvercare_voice::call::{
    CallOptions, CallState, DuplexCallSession, InboundEvent, JPEG_MIME, OutboundMessage,
    SessionSetup, Speaker,
};
use silvercare_voice::devices::{
    AcquireOutcome, AudioTrack, DeviceResourceManager, MediaStream, VideoTrack,
};
use silvercare_voice::voice::{OUTPUT_SAMPLE_RATE, PlaybackScheduler, codec};
use tokio_test::{assert_err, assert_ok};

mod common;

use common::{FakeMedia, FakeOutput, FakeTrack, FakeTransport, scheduler};

fn options() -> CallOptions {
    CallOptions {
        setup: SessionSetup {
            model: "models/test".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "be kind".to_string(),
        },
        capture_interval: Duration::from_millis(250),
        video_interval: Duration::from_secs(1),
        video_width: 320,
        jpeg_quality: 50,
    }
}

struct Harness {
    session: DuplexCallSession,
    transport: Arc<FakeTransport>,
    scheduler: Arc<PlaybackScheduler>,
    output: Arc<FakeOutput>,
    mic: Arc<FakeTrack>,
}

fn harness(with_mic: bool, transport: Arc<FakeTransport>) -> Harness {
    let (scheduler, output) = scheduler();
    let mic = FakeTrack::new();
    let camera = FakeTrack::new();

    let audio: Option<Arc<dyn AudioTrack>> = if with_mic {
        let track: Arc<dyn AudioTrack> = mic.clone();
        Some(track)
    } else {
        None
    };
    let video: Arc<dyn VideoTrack> = camera;
    let media = MediaStream::new(audio, Some(video));

    let session = DuplexCallSession::new(
        transport.clone(),
        scheduler.clone(),
        media,
        !with_mic,
        options(),
    );
    Harness {
        session,
        transport,
        scheduler,
        output,
        mic,
    }
}

fn agent_audio(duration: Duration) -> InboundEvent {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let samples = (duration.as_secs_f64() * f64::from(OUTPUT_SAMPLE_RATE)) as usize;
    InboundEvent::Audio {
        data: codec::encode(&vec![0u8; samples * 2]),
        sample_rate: OUTPUT_SAMPLE_RATE,
    }
}

fn drain(outbound: &mut tokio::sync::mpsc::Receiver<OutboundMessage>) -> (usize, usize) {
    let (mut audio, mut video) = (0, 0);
    while let Ok(message) = outbound.try_recv() {
        if let OutboundMessage::Media(chunk) = message {
            if chunk.is_audio() {
                audio += 1;
            } else {
                assert_eq!(chunk.mime_type, JPEG_MIME);
                video += 1;
            }
        }
    }
    (audio, video)
}

#[tokio::test(start_paused = true)]
async fn test_connect_streams_audio_and_video() {
    let h = harness(true, FakeTransport::new());

    h.session.connect().await.unwrap();
    assert_eq!(h.session.state(), CallState::Active);

    let mut connection = h.transport.take_connection().unwrap();
    assert_eq!(connection.setup.voice, "Kore");

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let (audio, video) = drain(&mut connection.outbound);
    assert!(audio >= 4, "expected audio every 250ms, got {audio}");
    assert!(video >= 1, "expected at least one frame, got {video}");
}

#[tokio::test(start_paused = true)]
async fn test_muted_call_sends_no_audio() {
    let h = harness(true, FakeTransport::new());
    h.session.set_muted(true);
    h.session.connect().await.unwrap();
    let mut connection = h.transport.take_connection().unwrap();

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let (audio, _) = drain(&mut connection.outbound);
    assert_eq!(audio, 0);

    h.session.set_muted(false);
    tokio::time::sleep(Duration::from_millis(600)).await;
    let (audio, _) = drain(&mut connection.outbound);
    assert!(audio >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_call_sends_video_only() {
    let h = harness(false, FakeTransport::new());
    assert!(h.session.mic_degraded());

    h.session.connect().await.unwrap();
    let mut connection = h.transport.take_connection().unwrap();

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let (audio, video) = drain(&mut connection.outbound);
    assert_eq!(audio, 0);
    assert!(video >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_agent_audio_plays_gaplessly() {
    let h = harness(true, FakeTransport::new());
    h.session.connect().await.unwrap();
    let connection = h.transport.take_connection().unwrap();

    for _ in 0..3 {
        connection
            .inbound
            .send(agent_audio(Duration::from_millis(200)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = h.output.started.lock().unwrap().clone();
    assert_eq!(started.len(), 3);
    assert!((started[1].1 - started[0].1 - 0.2).abs() < 1e-6);
    assert!((started[2].1 - started[1].1 - 0.2).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_empties_active_set() {
    let h = harness(true, FakeTransport::new());
    h.session.connect().await.unwrap();
    let connection = h.transport.take_connection().unwrap();

    for _ in 0..3 {
        connection
            .inbound
            .send(agent_audio(Duration::from_millis(500)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.scheduler.active_count(), 3);

    connection.inbound.send(InboundEvent::Interrupted).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.scheduler.active_count(), 0);
    assert_eq!(h.output.stopped.lock().unwrap().len(), 3);
    assert_eq!(h.session.state(), CallState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_transcripts_are_logged_per_turn() {
    let h = harness(true, FakeTransport::new());
    h.session.connect().await.unwrap();
    let connection = h.transport.take_connection().unwrap();

    for event in [
        InboundEvent::OutputTranscript("您好，".to_string()),
        InboundEvent::InputTranscript("今天".to_string()),
        InboundEvent::InputTranscript("腰有点疼".to_string()),
        InboundEvent::OutputTranscript("要多休息。".to_string()),
    ] {
        connection.inbound.send(event).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.session.transcript().is_empty());

    connection.inbound.send(InboundEvent::TurnComplete).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let transcript = h.session.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].speaker, Speaker::User);
    assert_eq!(transcript[0].text, "今天腰有点疼");
    assert_eq!(transcript[1].speaker, Speaker::Agent);
    assert_eq!(transcript[1].text, "您好，要多休息。");
}

#[tokio::test(start_paused = true)]
async fn test_agent_close_ends_session_and_releases_media() {
    let h = harness(true, FakeTransport::new());
    h.session.connect().await.unwrap();
    let connection = h.transport.take_connection().unwrap();

    connection
        .inbound
        .send(agent_audio(Duration::from_secs(1)))
        .await
        .unwrap();
    connection.inbound.send(InboundEvent::Closed(None)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), h.session.ended())
        .await
        .unwrap();

    assert_eq!(h.session.state(), CallState::Closed);
    assert!(!AudioTrack::is_live(&*h.mic));
    assert_eq!(h.scheduler.active_count(), 0);
}

async fn wait_for_error(session: &DuplexCallSession) -> CallState {
    let mut states = session.subscribe();
    tokio::time::timeout(
        Duration::from_secs(1),
        states.wait_for(|s| matches!(s, CallState::Error(_))),
    )
    .await
    .unwrap()
    .unwrap()
    .clone()
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_can_be_retried() {
    let h = harness(true, FakeTransport::new());
    assert_ok!(h.session.connect().await);

    drop(h.transport.take_connection());
    wait_for_error(&h.session).await;

    // Media stays with the session for the retry
    assert!(AudioTrack::is_live(&*h.mic));
    assert_ok!(h.session.retry().await);
    assert_eq!(h.session.state(), CallState::Active);
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 2);

    let mut connection = h.transport.take_connection().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    let (audio, _) = drain(&mut connection.outbound);
    assert!(audio >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_socket_error_mid_call_reports_error() {
    let h = harness(true, FakeTransport::new());
    assert_ok!(h.session.connect().await);
    let connection = h.transport.take_connection().unwrap();

    connection
        .inbound
        .send(agent_audio(Duration::from_secs(1)))
        .await
        .unwrap();
    connection
        .inbound
        .send(InboundEvent::Failed("connection reset".to_string()))
        .await
        .unwrap();

    assert_eq!(
        wait_for_error(&h.session).await,
        CallState::Error("connection reset".to_string())
    );
    assert_eq!(h.scheduler.active_count(), 0);

    h.session.close();
    assert_eq!(h.session.state(), CallState::Closed);
    assert!(!AudioTrack::is_live(&*h.mic));
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent_and_stops_sending() {
    let h = harness(true, FakeTransport::new());
    h.session.connect().await.unwrap();
    let mut connection = h.transport.take_connection().unwrap();

    h.session.close();
    h.session.close();
    assert_eq!(h.session.state(), CallState::Closed);
    assert!(!AudioTrack::is_live(&*h.mic));

    tokio::time::sleep(Duration::from_secs(2)).await;
    drain(&mut connection.outbound);
    assert!(connection.outbound.recv().await.is_none());

    assert!(h.session.connect().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_can_be_retried() {
    let h = harness(true, FakeTransport::failing());

    assert_err!(h.session.connect().await);
    assert!(matches!(h.session.state(), CallState::Error(_)));

    h.transport.fail.store(false, Ordering::SeqCst);
    assert_ok!(h.session.retry().await);

    assert_eq!(h.session.state(), CallState::Active);
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_requires_error_state() {
    let h = harness(true, FakeTransport::new());
    assert_ok!(h.session.connect().await);
    assert_err!(h.session.retry().await);
}

#[tokio::test(start_paused = true)]
async fn test_replaced_media_streams_without_reconnecting() {
    let h = harness(false, FakeTransport::new());
    assert_ok!(h.session.connect().await);
    let mut connection = h.transport.take_connection().unwrap();

    let mic: Arc<dyn AudioTrack> = FakeTrack::new();
    let camera: Arc<dyn VideoTrack> = FakeTrack::new();
    h.session
        .replace_media(MediaStream::new(Some(mic), Some(camera)), false);
    assert!(!h.session.mic_degraded());

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let (audio, video) = drain(&mut connection.outbound);
    assert!(audio >= 4, "expected audio from the new microphone, got {audio}");
    assert!(video >= 1);
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closed_session_refuses_new_media() {
    let h = harness(true, FakeTransport::new());
    h.session.close();

    let camera = FakeTrack::new();
    let track: Arc<dyn VideoTrack> = camera.clone();
    h.session.replace_media(MediaStream::new(None, Some(track)), true);
    assert!(!VideoTrack::is_live(&*camera));
}

#[tokio::test]
async fn test_acquire_falls_back_to_video_when_mic_denied() {
    let media = FakeMedia::new(2, false);
    let mut devices = DeviceResourceManager::new(media.clone());

    let outcome = devices.acquire(0).await;
    assert!(matches!(outcome, AcquireOutcome::Degraded(_)));
    assert!(devices.mic_degraded());

    let requests = media.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].audio);
    assert!(!requests[1].audio);
    assert!(requests[1].camera.is_some());
}

#[tokio::test]
async fn test_acquire_without_cameras_is_audio_only() {
    let media = FakeMedia::new(0, true);
    let mut devices = DeviceResourceManager::new(media.clone());

    let outcome = devices.acquire(0).await;
    let stream = outcome.stream().unwrap();
    assert!(stream.audio().is_some());
    assert!(stream.video().is_none());
}

#[tokio::test]
async fn test_cycle_wraps_around_cameras() {
    let media = FakeMedia::new(2, true);
    let mut devices = DeviceResourceManager::new(media);

    devices.acquire(1).await;
    assert_eq!(devices.inventory().current_index, 1);

    devices.cycle().await;
    assert_eq!(devices.inventory().current_index, 0);
}
