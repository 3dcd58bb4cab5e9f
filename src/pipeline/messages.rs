//! Message types passed between pipeline stages.

use bytes::Bytes;

/// A raw binary audio frame received from the client transport.
///
/// PCM 16-bit little-endian mono at the configured sample rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Encoded sample bytes.
    pub bytes: Bytes,
}

/// A transcript event from the speech-recognition backend.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    /// The recognized text.
    pub text: String,
    /// Whether this is a final transcript (vs interim/partial).
    ///
    /// Interim events are advisory (live captions) and never enter the
    /// dialogue pipeline.
    pub is_final: bool,
    /// Backend-reported confidence in \[0, 1\].
    pub confidence: f32,
}

/// A single token emitted by the LLM during streaming generation.
#[derive(Debug, Clone)]
pub struct TokenEvent {
    /// The decoded text fragment.
    pub text: String,
    /// Whether this is the final token in the response.
    pub is_end: bool,
}

/// A sentence accumulated from LLM tokens, ready for TTS.
#[derive(Debug, Clone)]
pub struct SentenceChunk {
    /// Complete sentence text. Empty text with `is_final` set marks
    /// end-of-response without a trailing sentence.
    pub text: String,
    /// Whether this is the last sentence in the response.
    pub is_final: bool,
}

/// Synthesized audio for one sentence, tagged for ordered delivery.
#[derive(Debug, Clone)]
pub struct SynthesizedChunk {
    /// Encoded audio bytes from the synthesis backend.
    pub bytes: Vec<u8>,
    /// Position of this chunk within the response. Chunks are delivered
    /// to the client in strictly increasing ordinal order.
    pub ordinal: u64,
    /// Whether this is the last chunk of the current response.
    pub is_final: bool,
}

/// A single turn of conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    /// Who produced the text.
    pub speaker: Speaker,
    /// The utterance or reply text.
    pub text: String,
}

/// Speaker attribution for a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    /// The human applicant.
    User,
    /// The voice agent.
    Assistant,
}

impl Speaker {
    /// Wire-format role label used when building LLM requests.
    #[must_use]
    pub fn role(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}
