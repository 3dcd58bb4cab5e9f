//! Speech recognition: audio ingress, the streaming recognizer seam, and
//! final-transcript filtering.
//!
//! The recognizer is a network service consuming audio frames and
//! emitting interim/final transcript events. Interim events are advisory
//! (live captions); only filtered final transcripts drive the dialogue.

use crate::config::AsrConfig;
use crate::error::{AgentError, Result};
use crate::pipeline::messages::{AudioFrame, TranscriptEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel sizes for the recognizer bridge.
const INPUT_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 32;

/// Input accepted by a live recognizer stream.
#[derive(Debug, Clone)]
pub enum RecognizerInput {
    /// One binary audio frame.
    Frame(AudioFrame),
    /// Liveness signal during transport idle periods, so the backend
    /// does not drop the connection for inactivity.
    KeepAlive,
    /// No more audio; flush and close.
    Finish,
}

/// A live recognition stream: frames go in, transcript events come out.
///
/// The event channel closing means the backend connection ended. That is
/// recoverable; the session supervisor owns the bounded reconnect policy.
pub struct RecognizerStream {
    /// Sink for audio frames and control inputs.
    pub input: mpsc::Sender<RecognizerInput>,
    /// Transcript events, interim and final.
    pub events: mpsc::Receiver<TranscriptEvent>,
}

/// A streaming speech-recognition backend.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open a new recognition stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend connection cannot be established.
    async fn start(&self) -> Result<RecognizerStream>;
}

/// WebSocket recognizer speaking the Deepgram live-transcription framing.
pub struct WsRecognizer {
    config: AsrConfig,
}

impl WsRecognizer {
    /// Create a recognizer from config.
    #[must_use]
    pub fn new(config: &AsrConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn endpoint_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.config.url)
            .map_err(|e| AgentError::Config(format!("invalid ASR url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("encoding", &self.config.encoding)
            .append_pair("sample_rate", &self.config.sample_rate.to_string())
            .append_pair("channels", "1")
            .append_pair(
                "interim_results",
                if self.config.interim_results {
                    "true"
                } else {
                    "false"
                },
            );
        Ok(url)
    }
}

#[async_trait]
impl SpeechRecognizer for WsRecognizer {
    async fn start(&self) -> Result<RecognizerStream> {
        let url = self.endpoint_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::Asr(format!("invalid ASR request: {e}")))?;
        if !self.config.api_key.is_empty() {
            let value = format!("Token {}", self.config.api_key)
                .parse()
                .map_err(|_| AgentError::Asr("invalid ASR api key".to_owned()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| AgentError::Asr(format!("recognizer connect failed: {e}")))?;
        info!("recognizer connected: {}", self.config.url);

        let (mut sink, mut source) = ws.split();
        let (input_tx, mut input_rx) = mpsc::channel::<RecognizerInput>(INPUT_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel::<TranscriptEvent>(EVENT_CHANNEL_SIZE);

        // Writer: forward frames and control messages to the backend.
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let result = match input {
                    RecognizerInput::Frame(frame) => {
                        sink.send(Message::Binary(frame.bytes.to_vec())).await
                    }
                    RecognizerInput::KeepAlive => {
                        debug!("recognizer keep-alive");
                        sink.send(Message::Text(r#"{"type":"KeepAlive"}"#.to_owned()))
                            .await
                    }
                    RecognizerInput::Finish => {
                        let _ = sink
                            .send(Message::Text(r#"{"type":"CloseStream"}"#.to_owned()))
                            .await;
                        let _ = sink.close().await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!("recognizer send failed: {e}");
                    break;
                }
            }
        });

        // Reader: parse backend result messages into transcript events.
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_result_message(&text)
                            && event_tx.send(event).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("recognizer read failed: {e}");
                        break;
                    }
                }
            }
            // event_tx drops here; the closed channel signals the
            // supervisor that the connection ended.
        });

        Ok(RecognizerStream {
            input: input_tx,
            events: event_rx,
        })
    }
}

/// Parse one Deepgram-style result message into a transcript event.
/// Empty transcripts (silence windows) are dropped at the adapter.
fn parse_result_message(text: &str) -> Option<TranscriptEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value["type"].as_str().is_some_and(|t| t != "Results") {
        return None;
    }
    let alternative = &value["channel"]["alternatives"][0];
    let transcript = alternative["transcript"].as_str()?.trim();
    if transcript.is_empty() {
        return None;
    }
    Some(TranscriptEvent {
        text: transcript.to_owned(),
        is_final: value["is_final"].as_bool().unwrap_or(false),
        confidence: alternative["confidence"].as_f64().unwrap_or(0.0) as f32,
    })
}

/// Audio ingress: forward client frames to the recognizer, injecting a
/// keep-alive whenever the transport goes idle.
pub async fn run_audio_ingress(
    mut frames: mpsc::Receiver<AudioFrame>,
    input: mpsc::Sender<RecognizerInput>,
    keepalive_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if input.send(RecognizerInput::Frame(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            () = tokio::time::sleep(keepalive_interval) => {
                if input.send(RecognizerInput::KeepAlive).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = input.send(RecognizerInput::Finish).await;
}

/// Known recognizer artifacts: phrases batch ASR models emit for silence
/// or music, which must never reach the dialogue.
const ASR_ARTIFACTS: &[&str] = &[
    "thanks for watching",
    "thank you for watching",
    "subtitles by",
    "amara.org",
    "copyright",
    "all rights reserved",
];

/// Admits final transcripts into the dialogue pipeline.
///
/// Drops empty/too-short text, consecutive duplicates (backends re-emit
/// the same utterance), known artifacts, and repeated-phrase loops.
#[derive(Debug, Default)]
pub struct TranscriptFilter {
    last_final: String,
}

impl TranscriptFilter {
    /// Check a final transcript; returns the cleaned text if admitted.
    pub fn accept(&mut self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let normalized = text.to_lowercase();
        let normalized = normalized.trim_matches([' ', '.', ',', '!', '?']);
        if normalized.chars().count() < 2 {
            return None;
        }
        if ASR_ARTIFACTS.iter().any(|a| normalized.contains(a)) {
            debug!("dropping recognizer artifact: {text}");
            return None;
        }
        if is_repetition_loop(normalized) {
            debug!("dropping repetition loop: {text}");
            return None;
        }
        if text == self.last_final {
            debug!("dropping duplicate transcript: {text}");
            return None;
        }

        self.last_final = text.to_owned();
        Some(text.to_owned())
    }

    /// Record text that entered the pipeline through another path (typed
    /// input), so an identical follow-up transcript is deduplicated.
    pub fn note(&mut self, text: &str) {
        self.last_final = text.trim().to_owned();
    }
}

/// Detect "text text text" style recognition loops: the utterance is two
/// identical halves, or a short leading phrase repeats three or more times.
fn is_repetition_loop(normalized: &str) -> bool {
    let words: Vec<&str> = normalized.split_whitespace().collect();

    if words.len() >= 4 {
        let mid = words.len() / 2;
        if words.len() % 2 == 0 && words[..mid] == words[mid..] {
            return true;
        }
    }

    if words.len() >= 6 {
        let phrase = words[..3].join(" ");
        if normalized.matches(&phrase).count() >= 3 {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    // ── parse_result_message ────────────────────────────────────────

    #[test]
    fn parses_final_result() {
        let msg = r#"{
            "type": "Results",
            "is_final": true,
            "channel": {"alternatives": [{"transcript": "my income is 5000", "confidence": 0.97}]}
        }"#;
        let event = parse_result_message(msg).unwrap();
        assert_eq!(event.text, "my income is 5000");
        assert!(event.is_final);
        assert!((event.confidence - 0.97).abs() < 1e-6);
    }

    #[test]
    fn empty_transcript_dropped() {
        let msg = r#"{
            "type": "Results",
            "is_final": false,
            "channel": {"alternatives": [{"transcript": "  ", "confidence": 0.0}]}
        }"#;
        assert!(parse_result_message(msg).is_none());
    }

    #[test]
    fn metadata_messages_ignored() {
        assert!(parse_result_message(r#"{"type":"Metadata","request_id":"x"}"#).is_none());
        assert!(parse_result_message("not json").is_none());
    }

    // ── TranscriptFilter ────────────────────────────────────────────

    #[test]
    fn admits_normal_speech() {
        let mut filter = TranscriptFilter::default();
        assert_eq!(
            filter.accept("My name is Alice."),
            Some("My name is Alice.".to_owned())
        );
    }

    #[test]
    fn drops_consecutive_duplicates() {
        let mut filter = TranscriptFilter::default();
        assert!(filter.accept("hello there").is_some());
        assert!(filter.accept("hello there").is_none());
        assert!(filter.accept("something else").is_some());
        // Non-consecutive repeats are allowed again.
        assert!(filter.accept("hello there").is_some());
    }

    #[test]
    fn drops_empty_and_single_letters() {
        let mut filter = TranscriptFilter::default();
        assert!(filter.accept("").is_none());
        assert!(filter.accept("   ").is_none());
        assert!(filter.accept("a.").is_none());
    }

    #[test]
    fn drops_known_artifacts() {
        let mut filter = TranscriptFilter::default();
        assert!(filter.accept("Thanks for watching!").is_none());
        assert!(filter.accept("Subtitles by the community").is_none());
    }

    #[test]
    fn drops_two_times_loop() {
        let mut filter = TranscriptFilter::default();
        assert!(filter.accept("check my loan check my loan").is_none());
    }

    #[test]
    fn drops_three_times_phrase_loop() {
        let mut filter = TranscriptFilter::default();
        assert!(filter
            .accept("I want a loan I want a loan I want a loan please")
            .is_none());
    }

    #[test]
    fn note_deduplicates_typed_input() {
        let mut filter = TranscriptFilter::default();
        filter.note("yes please");
        assert!(filter.accept("yes please").is_none());
    }

    // ── ingress keep-alive ──────────────────────────────────────────

    #[tokio::test]
    async fn idle_transport_emits_keepalive() {
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (input_tx, mut input_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let ingress = tokio::spawn(run_audio_ingress(
            frame_rx,
            input_tx,
            Duration::from_millis(20),
            cancel.clone(),
        ));

        // No frames sent; the first input must be a keep-alive.
        let first = input_rx.recv().await.unwrap();
        assert!(matches!(first, RecognizerInput::KeepAlive));

        drop(frame_tx);
        ingress.await.unwrap();
        // Channel drains with a Finish once the transport closes.
        let mut saw_finish = false;
        while let Some(input) = input_rx.recv().await {
            if matches!(input, RecognizerInput::Finish) {
                saw_finish = true;
            }
        }
        assert!(saw_finish);
    }
}
