//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::time::Duration;

use silvercare_voice::Error;
use silvercare_voice::voice::{
    DialogueDecision, DialogueState, SegmenterMode, SegmenterTimeouts, SentenceStreamingTts,
    SpeechActivityDetector, SpeechSegmenter, SubmitMode, WakeWordDialogue, samples_to_wav,
};
use tokio::time::Instant;

mod common;

use common::{FakeSynth, scheduler, silence, speaker};

fn dialogue() -> WakeWordDialogue {
    WakeWordDialogue::new(
        vec!["小玲".to_string(), "晓玲".to_string()],
        vec!["几点".to_string(), "天气".to_string()],
        Duration::from_secs(8),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_plays_back_to_back_in_order() {
    let (scheduler, output) = scheduler();
    let half = silence(Duration::from_millis(500));

    let first = scheduler.enqueue(&half).unwrap();
    let second = scheduler.enqueue(&half).unwrap();
    let third = scheduler.enqueue(&half).unwrap();

    assert!((first.start - 0.0).abs() < 1e-9);
    assert!((second.start - first.end).abs() < 1e-9);
    assert!((third.start - second.end).abs() < 1e-9);
    assert!((scheduler.next_start_time() - 1.5).abs() < 1e-9);
    assert_eq!(scheduler.active_count(), 3);
    assert_eq!(output.started.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_after_idle_starts_now() {
    let (scheduler, _output) = scheduler();
    scheduler.enqueue(&silence(Duration::from_millis(200))).unwrap();

    tokio::time::advance(Duration::from_secs(1)).await;

    let late = scheduler.enqueue(&silence(Duration::from_millis(200))).unwrap();
    assert!(late.start >= 1.0 - 1e-6);
    assert_eq!(scheduler.active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_finished_sources_leave_the_active_set() {
    let (scheduler, _output) = scheduler();
    scheduler.enqueue(&silence(Duration::from_millis(300))).unwrap();
    scheduler.enqueue(&silence(Duration::from_millis(300))).unwrap();

    scheduler.wait_idle().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(scheduler.active_count(), 0);
    assert!(scheduler.remaining().is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_flush_stops_everything_and_resets_timeline() {
    let (scheduler, output) = scheduler();
    for _ in 0..3 {
        scheduler.enqueue(&silence(Duration::from_millis(500))).unwrap();
    }

    assert_eq!(scheduler.flush_all(), 3);
    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(output.stopped.lock().unwrap().len(), 3);

    // Flushing an empty timeline is a no-op
    assert_eq!(scheduler.flush_all(), 0);

    let next = scheduler.enqueue(&silence(Duration::from_millis(500))).unwrap();
    assert!(next.start < 0.01);
}

#[tokio::test(start_paused = true)]
async fn test_empty_buffer_is_not_scheduled() {
    let (scheduler, output) = scheduler();
    assert!(scheduler.enqueue(&silence(Duration::ZERO)).is_none());
    assert!(output.started.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silence_completes_utterance_exactly_once() {
    let timeouts = SegmenterTimeouts::default();
    let mut segmenter = SpeechSegmenter::new(timeouts);
    let start = Instant::now();

    segmenter.on_interim("小玲", SegmenterMode::Ambient, start);
    segmenter.on_interim("小玲 今天天气", SegmenterMode::Ambient, start + Duration::from_millis(400));

    // Still inside the window measured from the last interim
    assert!(segmenter.poll(start + Duration::from_millis(1_900)).is_none());

    let done = start + Duration::from_millis(400) + timeouts.ambient;
    assert_eq!(segmenter.poll(done).as_deref(), Some("小玲 今天天气"));
    assert!(segmenter.poll(done + Duration::from_secs(5)).is_none());
    assert!(segmenter.on_final("").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_final_completes_without_timer() {
    let mut segmenter = SpeechSegmenter::new(SegmenterTimeouts::default());
    let now = Instant::now();

    segmenter.on_interim("小玲 几点", SegmenterMode::Ambient, now);
    assert_eq!(segmenter.on_final("小玲 几点了").as_deref(), Some("小玲 几点了"));
    assert!(segmenter.deadline().is_none());
    assert!(segmenter.poll(now + Duration::from_secs(10)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_command_mode_uses_shorter_window() {
    let timeouts = SegmenterTimeouts::default();
    assert!(timeouts.command < timeouts.ambient);

    let mut segmenter = SpeechSegmenter::new(timeouts);
    let now = Instant::now();
    segmenter.on_interim("现在几点", SegmenterMode::Command, now);
    assert_eq!(segmenter.deadline(), Some(now + timeouts.command));
}

#[tokio::test(start_paused = true)]
async fn test_bare_wake_word_awaits_command_then_classifies_once() {
    let mut dialogue = dialogue();
    let now = Instant::now();

    assert_eq!(dialogue.handle_utterance("小玲", now), DialogueDecision::Acknowledge);
    // Still idle until the prompt has played
    assert_eq!(dialogue.state(), DialogueState::Idle);
    assert!(dialogue.acknowledged(now));
    assert_eq!(dialogue.state(), DialogueState::AwaitingCommand);
    assert_eq!(dialogue.segmenter_mode(), SegmenterMode::Command);

    assert_eq!(
        dialogue.handle_utterance("帮我看看这个药", now + Duration::from_secs(2)),
        DialogueDecision::Classify("帮我看看这个药".to_string())
    );
    assert_eq!(dialogue.state(), DialogueState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_wake_word_with_command_never_awaits() {
    let mut dialogue = dialogue();
    let now = Instant::now();

    assert_eq!(
        dialogue.handle_utterance("晓玲，今天天气怎么样", now),
        DialogueDecision::Classify("今天天气怎么样".to_string())
    );
    assert_eq!(dialogue.state(), DialogueState::Idle);
    assert!(!dialogue.acknowledged(now));
}

#[tokio::test(start_paused = true)]
async fn test_ambient_speech_is_ignored() {
    let mut dialogue = dialogue();
    assert_eq!(
        dialogue.handle_utterance("今天天气怎么样", Instant::now()),
        DialogueDecision::Ignore
    );
}

#[tokio::test(start_paused = true)]
async fn test_command_window_lapses_and_activity_extends_it() {
    let mut dialogue = dialogue();
    let start = Instant::now();
    dialogue.handle_utterance("小玲", start);
    dialogue.acknowledged(start);

    dialogue.note_activity(start + Duration::from_secs(5));
    assert!(!dialogue.expire(start + Duration::from_secs(9)));
    assert!(dialogue.expire(start + Duration::from_secs(13)));
    assert_eq!(dialogue.state(), DialogueState::Idle);
}

#[test]
fn test_empty_wake_word_list_is_rejected() {
    let result = WakeWordDialogue::new(Vec::new(), Vec::new(), Duration::from_secs(8));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_streamed_reply_is_spoken_clause_by_clause() {
    let (speech, output, synth) = speaker();
    let chunks = ["你", "好。今", "天天气不错", "！"]
        .into_iter()
        .map(|c| Ok::<_, Error>(c.to_string()));

    let spoken = speech
        .speak_stream(futures::stream::iter(chunks), SubmitMode::Append)
        .await
        .unwrap();

    assert_eq!(synth.spoken(), vec!["你好。", "今天天气不错！"]);
    assert_eq!(spoken.text, "你好。今天天气不错！");
    assert_eq!(spoken.clauses_played, 2);

    let started = output.started.lock().unwrap().clone();
    assert_eq!(started.len(), 2);
    assert!((started[1].1 - started[0].1 - 0.5).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn test_failed_clause_is_skipped() {
    let (scheduler, output) = scheduler();
    let synth = FakeSynth::failing_on("坏");
    let speech = SentenceStreamingTts::new(scheduler, synth.clone());

    let spoken = speech
        .speak("第一句。坏的一句。第三句。", SubmitMode::Append)
        .await
        .unwrap();

    assert_eq!(spoken.clauses_played, 2);
    assert_eq!(spoken.clauses_failed, 1);
    assert_eq!(synth.spoken(), vec!["第一句。", "第三句。"]);
    assert_eq!(output.started.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_mode_cuts_off_previous_speech() {
    let (speech, output, _synth) = speaker();

    speech.speak("早上好。记得吃药。", SubmitMode::Append).await.unwrap();
    assert_eq!(speech.scheduler().active_count(), 2);

    speech.speak("有人按门铃。", SubmitMode::Interrupt).await.unwrap();

    assert_eq!(output.stopped.lock().unwrap().len(), 2);
    assert_eq!(speech.scheduler().active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_append_mode_queues_after_current_speech() {
    let (speech, output, _synth) = speaker();

    speech.speak("第一句。", SubmitMode::Append).await.unwrap();
    speech.speak("第二句。", SubmitMode::Append).await.unwrap();

    assert!(output.stopped.lock().unwrap().is_empty());
    let started = output.started.lock().unwrap().clone();
    assert!((started[1].1 - 0.5).abs() < 1e-6);
}

#[test]
fn test_activity_detector_segments_speech() {
    let mut detector = SpeechActivityDetector::new();

    // 0.5s of loud signal then enough silence to close the segment
    let speech: Vec<f32> = (0..8_000).map(|i| if i % 2 == 0 { 0.3 } else { -0.3 }).collect();
    assert!(detector.process(&speech).is_none());
    assert!(detector.is_listening());

    let segment = detector.process(&vec![0.0; 9_000]);
    assert!(segment.is_some());
    assert!(!detector.is_listening());
}

#[test]
fn test_activity_detector_ignores_silence() {
    let mut detector = SpeechActivityDetector::new();
    assert!(detector.process(&vec![0.0; 16_000]).is_none());
    assert!(!detector.is_listening());
}

#[test]
fn test_samples_to_wav_produces_valid_wav() {
    let samples = vec![0.0_f32, 0.5, -0.5, 1.0, -1.0];
    let wav = samples_to_wav(&samples, 16_000).unwrap();

    assert_eq!(&wav[0..4], b"RIFF");
    assert_eq!(&wav[8..12], b"WAVE");

    let reader = hound::WavReader::new(Cursor::new(&wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 16_000);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len(), 5);
}
