//! Sentence segmentation and ordered TTS dispatch.
//!
//! LLM tokens are buffered until a sentence boundary, then each sentence
//! goes to the synthesis backend. Synthesis calls run concurrently, but
//! completed audio is released strictly in sentence order: a later
//! sentence that finishes synthesis first waits behind the earlier one.

use crate::error::Result;
use crate::pipeline::messages::{SentenceChunk, SynthesizedChunk};
use crate::tts::SpeechSynthesizer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Accumulates streamed text and yields complete sentences.
#[derive(Debug)]
pub struct SentenceSegmenter {
    buffer: String,
    max_chars: usize,
}

impl SentenceSegmenter {
    /// Create a segmenter with the given fallback-flush length.
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars,
        }
    }

    /// Feed streamed text; returns any sentences completed by it.
    ///
    /// A sentence completes at terminal punctuation followed by
    /// whitespace. If the buffer grows past `max_chars` without a
    /// terminator the whole buffer is flushed, bounding latency on
    /// run-on output.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut sentences = Vec::new();

        while let Some(pos) = find_sentence_boundary(&self.buffer) {
            let sentence = self.buffer[..=pos].trim().to_owned();
            self.buffer = self.buffer[pos + 1..].to_owned();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }

        if self.buffer.len() > self.max_chars {
            let sentence = self.buffer.trim().to_owned();
            self.buffer.clear();
            if !sentence.is_empty() {
                debug!("length-based sentence flush ({} chars)", sentence.len());
                sentences.push(sentence);
            }
        }

        sentences
    }

    /// End of stream: flush any remainder as a final sentence even if it
    /// lacks terminal punctuation ("Yes", "Hello").
    pub fn flush(&mut self) -> Option<String> {
        let sentence = self.buffer.trim().to_owned();
        self.buffer.clear();
        if sentence.is_empty() {
            None
        } else {
            Some(sentence)
        }
    }
}

/// Find a sentence boundary: terminal punctuation followed by whitespace,
/// or a newline. Decimal points ("3.5") do not match.
fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        match c {
            '.' | '!' | '?' => {
                let rest = &text[i + 1..];
                if rest.starts_with(' ') || rest.starts_with('\n') || rest.starts_with('\t') {
                    return Some(i);
                }
            }
            '\n' => return Some(i),
            _ => {}
        }
    }
    None
}

/// Consume sentences, synthesize them concurrently, and emit audio
/// chunks in strictly increasing ordinal order.
///
/// Ordering is structural: synthesis tasks are queued in sentence order
/// and awaited in that same order, so a later chunk can never overtake
/// an earlier one no matter which network call finishes first. The queue
/// capacity bounds how many synthesis calls are in flight.
///
/// A failed synthesis drops that sentence's audio (its ordinal is simply
/// skipped); only the current response is affected, never the session.
pub async fn run_tts_dispatcher(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    max_concurrent: usize,
    mut sentences: mpsc::Receiver<SentenceChunk>,
    audio_tx: mpsc::Sender<SynthesizedChunk>,
    cancel: CancellationToken,
) {
    type SynthHandle = (u64, bool, JoinHandle<Result<Vec<u8>>>);
    let (handle_tx, mut handle_rx) = mpsc::channel::<SynthHandle>(max_concurrent.max(1));

    let spawn_cancel = cancel.clone();
    let spawner = tokio::spawn(async move {
        let mut ordinal: u64 = 0;
        while let Some(sentence) = sentences.recv().await {
            if spawn_cancel.is_cancelled() {
                break;
            }
            let synth = Arc::clone(&synthesizer);
            let is_final = sentence.is_final;
            let handle = tokio::spawn(async move {
                if sentence.text.is_empty() {
                    // End-of-response marker, nothing to synthesize.
                    return Ok(Vec::new());
                }
                synth.synthesize(&sentence.text).await
            });
            if handle_tx.send((ordinal, is_final, handle)).await.is_err() {
                break;
            }
            ordinal += 1;
            if is_final {
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => None,
            next = handle_rx.recv() => next,
        };
        let Some((ordinal, is_final, mut handle)) = next else {
            break;
        };

        let result = tokio::select! {
            () = cancel.cancelled() => {
                handle.abort();
                break;
            }
            result = &mut handle => result,
        };

        match result {
            Ok(Ok(bytes)) => {
                let chunk = SynthesizedChunk {
                    bytes,
                    ordinal,
                    is_final,
                };
                if audio_tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                error!("TTS error: {e}");
                // Still unblock downstream state on the last sentence.
                if is_final {
                    let marker = SynthesizedChunk {
                        bytes: Vec::new(),
                        ordinal,
                        is_final: true,
                    };
                    let _ = audio_tx.send(marker).await;
                }
            }
            Err(e) => {
                error!("TTS task join failed: {e}");
            }
        }
    }

    // Drop any still-queued synthesis work on the way out.
    handle_rx.close();
    while let Ok((_, _, handle)) = handle_rx.try_recv() {
        handle.abort();
    }
    spawner.abort();
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::error::AgentError;
    use async_trait::async_trait;
    use std::time::Duration;

    // ── SentenceSegmenter ───────────────────────────────────────────

    #[test]
    fn splits_on_terminal_punctuation() {
        let mut seg = SentenceSegmenter::new(240);
        assert!(seg.push("Hello the").is_empty());
        let sentences = seg.push("re. How are you? I");
        assert_eq!(sentences, vec!["Hello there.", "How are you?"]);
        assert_eq!(seg.flush(), Some("I".to_owned()));
    }

    #[test]
    fn decimal_point_is_not_a_boundary() {
        let mut seg = SentenceSegmenter::new(240);
        let sentences = seg.push("The rate is 3.5 percent. Next");
        assert_eq!(sentences, vec!["The rate is 3.5 percent."]);
    }

    #[test]
    fn trailing_period_waits_for_whitespace() {
        let mut seg = SentenceSegmenter::new(240);
        // "." at end of chunk could still be a decimal point.
        assert!(seg.push("It costs 5.").is_empty());
        let sentences = seg.push(" Yes.");
        assert_eq!(sentences, vec!["It costs 5."]);
        assert_eq!(seg.flush(), Some("Yes.".to_owned()));
    }

    #[test]
    fn newline_ends_a_sentence() {
        let mut seg = SentenceSegmenter::new(240);
        let sentences = seg.push("First line\nsecond");
        assert_eq!(sentences, vec!["First line"]);
    }

    #[test]
    fn length_fallback_flush() {
        let mut seg = SentenceSegmenter::new(20);
        let sentences = seg.push("a run on sentence with no punctuation at all");
        assert_eq!(sentences.len(), 1);
        assert_eq!(seg.flush(), None);
    }

    #[test]
    fn flush_on_empty_is_none() {
        let mut seg = SentenceSegmenter::new(240);
        assert_eq!(seg.flush(), None);
        seg.push("   ");
        assert_eq!(seg.flush(), None);
    }

    // ── run_tts_dispatcher ──────────────────────────────────────────

    /// Synthesizer whose delay shrinks with each sentence, so later
    /// ordinals complete before earlier ones.
    struct InvertedLatencySynth;

    #[async_trait]
    impl SpeechSynthesizer for InvertedLatencySynth {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
            let delay = match text {
                "one" => 80,
                "two" => 40,
                _ => 5,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(text.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn chunks_arrive_in_ordinal_order_despite_latency_inversion() {
        let (sentence_tx, sentence_rx) = mpsc::channel(8);
        let (audio_tx, mut audio_rx) = mpsc::channel(8);
        let dispatcher = tokio::spawn(run_tts_dispatcher(
            Arc::new(InvertedLatencySynth),
            3,
            sentence_rx,
            audio_tx,
            CancellationToken::new(),
        ));

        for (text, is_final) in [("one", false), ("two", false), ("three", true)] {
            sentence_tx
                .send(SentenceChunk {
                    text: text.to_owned(),
                    is_final,
                })
                .await
                .unwrap();
        }
        drop(sentence_tx);

        let mut chunks = Vec::new();
        while let Some(chunk) = audio_rx.recv().await {
            chunks.push(chunk);
        }
        dispatcher.await.unwrap();

        let ordinals: Vec<u64> = chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert_eq!(chunks[0].bytes, b"one");
        assert_eq!(chunks[2].bytes, b"three");
        assert!(chunks[2].is_final);
    }

    struct FailOnSecondSynth;

    #[async_trait]
    impl SpeechSynthesizer for FailOnSecondSynth {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
            if text == "bad" {
                Err(AgentError::Tts("backend down".to_owned()))
            } else {
                Ok(text.as_bytes().to_vec())
            }
        }
    }

    #[tokio::test]
    async fn failed_sentence_is_skipped_not_fatal() {
        let (sentence_tx, sentence_rx) = mpsc::channel(8);
        let (audio_tx, mut audio_rx) = mpsc::channel(8);
        let dispatcher = tokio::spawn(run_tts_dispatcher(
            Arc::new(FailOnSecondSynth),
            2,
            sentence_rx,
            audio_tx,
            CancellationToken::new(),
        ));

        for (text, is_final) in [("ok", false), ("bad", false), ("done", true)] {
            sentence_tx
                .send(SentenceChunk {
                    text: text.to_owned(),
                    is_final,
                })
                .await
                .unwrap();
        }
        drop(sentence_tx);

        let mut chunks = Vec::new();
        while let Some(chunk) = audio_rx.recv().await {
            chunks.push(chunk);
        }
        dispatcher.await.unwrap();

        // Ordinal 1 is skipped; order stays non-decreasing.
        let ordinals: Vec<u64> = chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 2]);
    }

    #[tokio::test]
    async fn cancellation_stops_emission() {
        let (sentence_tx, sentence_rx) = mpsc::channel(8);
        let (audio_tx, mut audio_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(run_tts_dispatcher(
            Arc::new(InvertedLatencySynth),
            2,
            sentence_rx,
            audio_tx,
            cancel.clone(),
        ));

        sentence_tx
            .send(SentenceChunk {
                text: "one".to_owned(),
                is_final: false,
            })
            .await
            .unwrap();
        cancel.cancel();
        dispatcher.await.unwrap();

        assert!(audio_rx.recv().await.is_none());
    }
}
