//! Language-model streaming: the generator seam and output demultiplexing.
//!
//! The agent's output convention is spoken text, then a fixed delimiter,
//! then a JSON field-update block. [`TokenDemux`] splits a token stream on
//! that convention while tolerating the delimiter straddling chunk
//! boundaries, and truncates generation if the model starts fabricating a
//! user turn inline.

pub mod api;

pub use api::OpenAiGenerator;

use crate::error::Result;
use crate::pipeline::messages::{ChatTurn, TokenEvent};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Marker the model emits when it starts role-playing the user.
const ROLE_CONFUSION_MARKER: &str = "user:";

/// A streaming language-model backend.
///
/// Implementations must stop network consumption promptly when `cancel`
/// fires, not merely stop forwarding tokens.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Start a streaming completion and return the token channel.
    ///
    /// The channel closes after a token with `is_end` set, or when the
    /// generation is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started. Mid-stream
    /// failures terminate the channel instead.
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TokenEvent>>;
}

/// What the demultiplexer produced for one pushed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// Speakable text to forward (may be empty while buffering).
    Speech(String),
    /// The model began fabricating a user turn. The contained text is
    /// everything speakable before the fabricated turn; the caller must
    /// cancel the underlying request.
    FabricatedTurn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxState {
    Speech,
    Payload,
    Truncated,
}

/// Splits a streamed LLM reply into speakable text and the trailing
/// structured-data payload.
///
/// Order-preserving and streaming-safe: a small tail is held back from
/// each emission so a delimiter (or role marker) split across chunk
/// boundaries is still detected. If the delimiter never appears, the
/// whole output is speech and [`TokenDemux::finish`] returns no payload.
#[derive(Debug)]
pub struct TokenDemux {
    delimiter: String,
    state: DemuxState,
    held: String,
    payload: String,
}

impl TokenDemux {
    /// Create a demultiplexer for the given payload delimiter.
    #[must_use]
    pub fn new(delimiter: &str) -> Self {
        Self {
            delimiter: delimiter.to_owned(),
            state: DemuxState::Speech,
            held: String::new(),
            payload: String::new(),
        }
    }

    /// Feed one streamed chunk; returns the text now safe to speak.
    pub fn push(&mut self, chunk: &str) -> DemuxEvent {
        match self.state {
            DemuxState::Truncated => DemuxEvent::Speech(String::new()),
            DemuxState::Payload => {
                self.payload.push_str(chunk);
                DemuxEvent::Speech(String::new())
            }
            DemuxState::Speech => {
                self.held.push_str(chunk);
                self.drain_speech()
            }
        }
    }

    fn drain_speech(&mut self) -> DemuxEvent {
        if let Some(i) = self.held.find(&self.delimiter) {
            let speech = self.held[..i].to_owned();
            let after = self.held[i + self.delimiter.len()..].to_owned();
            self.held.clear();
            self.payload.push_str(&after);
            self.state = DemuxState::Payload;

            // The speech before the delimiter can itself contain a
            // fabricated turn.
            if let Some(j) = find_role_marker(&speech) {
                self.state = DemuxState::Truncated;
                return DemuxEvent::FabricatedTurn(speech[..j].to_owned());
            }
            return DemuxEvent::Speech(speech);
        }

        if let Some(j) = find_role_marker(&self.held) {
            let speech = self.held[..j].to_owned();
            self.held.clear();
            self.state = DemuxState::Truncated;
            return DemuxEvent::FabricatedTurn(speech);
        }

        // Hold back any suffix that could be the start of the delimiter
        // or the role marker arriving in the next chunk.
        let hold = self.holdback_len();
        let emit_to = self.held.len() - hold;
        let speech: String = self.held.drain(..emit_to).collect();
        DemuxEvent::Speech(speech)
    }

    /// Longest suffix of `held` that is a proper prefix of the delimiter
    /// or of the role marker.
    fn holdback_len(&self) -> usize {
        let max = self
            .delimiter
            .len()
            .max(ROLE_CONFUSION_MARKER.len())
            .saturating_sub(1)
            .min(self.held.len());
        for len in (1..=max).rev() {
            let start = self.held.len() - len;
            if !self.held.is_char_boundary(start) {
                continue;
            }
            let suffix = &self.held[start..];
            if self.delimiter.starts_with(suffix)
                || ROLE_CONFUSION_MARKER.starts_with(suffix.to_ascii_lowercase().as_str())
            {
                return len;
            }
        }
        0
    }

    /// Whether generation was truncated for role confusion.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.state == DemuxState::Truncated
    }

    /// End of stream: remaining speakable text and the payload block, if
    /// the delimiter ever appeared.
    #[must_use]
    pub fn finish(self) -> (String, Option<String>) {
        let speech = match self.state {
            DemuxState::Speech => self.held,
            DemuxState::Payload | DemuxState::Truncated => String::new(),
        };
        let payload = if self.payload.trim().is_empty() {
            None
        } else {
            Some(self.payload)
        };
        (speech, payload)
    }
}

fn find_role_marker(text: &str) -> Option<usize> {
    text.to_ascii_lowercase().find(ROLE_CONFUSION_MARKER)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    const DELIM: &str = "|||JSON|||";

    fn demux_all(chunks: &[&str]) -> (String, Option<String>, bool) {
        let mut demux = TokenDemux::new(DELIM);
        let mut speech = String::new();
        let mut truncated = false;
        for chunk in chunks {
            match demux.push(chunk) {
                DemuxEvent::Speech(s) => speech.push_str(&s),
                DemuxEvent::FabricatedTurn(s) => {
                    speech.push_str(&s);
                    truncated = true;
                }
            }
        }
        let (rest, payload) = demux.finish();
        speech.push_str(&rest);
        (speech, payload, truncated)
    }

    // ── delimiter handling ──────────────────────────────────────────

    #[test]
    fn splits_speech_from_payload() {
        let (speech, payload, _) =
            demux_all(&["Hello there.", DELIM, r#"{"name":"Bob"}"#]);
        assert_eq!(speech, "Hello there.");
        assert_eq!(payload.as_deref(), Some(r#"{"name":"Bob"}"#));
    }

    #[test]
    fn delimiter_straddles_chunk_boundary() {
        let (speech, payload, _) =
            demux_all(&["Sounds good! ||", "|JSO", "N|||", r#"{"a":1}"#]);
        assert_eq!(speech, "Sounds good! ");
        assert_eq!(payload.as_deref(), Some(r#"{"a":1}"#));
    }

    #[test]
    fn delimiter_inside_single_chunk_with_payload() {
        let (speech, payload, _) =
            demux_all(&[r#"Okay.|||JSON|||{"credit_score":700}"#]);
        assert_eq!(speech, "Okay.");
        assert_eq!(payload.as_deref(), Some(r#"{"credit_score":700}"#));
    }

    #[test]
    fn missing_delimiter_means_all_speech() {
        let (speech, payload, _) = demux_all(&["Just ", "a plain ", "reply."]);
        assert_eq!(speech, "Just a plain reply.");
        assert!(payload.is_none());
    }

    #[test]
    fn payload_spanning_chunks_is_buffered_whole() {
        let (speech, payload, _) = demux_all(&[
            "Done. ",
            DELIM,
            r#"{"name""#,
            r#": "Eve","#,
            r#" "loan_amount": 9000}"#,
        ]);
        assert_eq!(speech, "Done. ");
        assert_eq!(
            payload.as_deref(),
            Some(r#"{"name": "Eve", "loan_amount": 9000}"#)
        );
    }

    #[test]
    fn false_prefix_is_eventually_spoken() {
        // "||" looks like a delimiter prefix but never completes.
        let (speech, payload, _) = demux_all(&["a || b ", "and more"]);
        assert_eq!(speech, "a || b and more");
        assert!(payload.is_none());
    }

    // ── role-confusion guard ────────────────────────────────────────

    #[test]
    fn fabricated_user_turn_is_truncated() {
        let (speech, payload, truncated) =
            demux_all(&["Thanks! ", "User: my income is fake"]);
        assert_eq!(speech, "Thanks! ");
        assert!(payload.is_none());
        assert!(truncated);
    }

    #[test]
    fn role_marker_straddling_chunks_is_caught() {
        let (speech, _, truncated) = demux_all(&["Okay. us", "er: hello"]);
        assert_eq!(speech, "Okay. ");
        assert!(truncated);
    }

    #[test]
    fn nothing_emitted_after_truncation() {
        let mut demux = TokenDemux::new(DELIM);
        assert_eq!(
            demux.push("user: I am the user"),
            DemuxEvent::FabricatedTurn(String::new())
        );
        assert_eq!(demux.push("more text"), DemuxEvent::Speech(String::new()));
        assert!(demux.truncated());
    }
}
