//! Wire protocol for the client WebSocket.
//!
//! Binary frames carry audio; text frames carry these JSON messages,
//! tagged `{"type": ..., "data": ...}`.

use crate::scoring::EligibilityStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Advisory live caption; never drives the dialogue.
    InterimTranscript(String),
    /// An accepted final transcript (or echoed typed input).
    FinalTranscript(String),
    /// A speakable LLM text fragment, streamed as generated.
    AiToken(String),
    /// One synthesized audio chunk, delivered in ordinal order.
    AudioChunk {
        /// Base64-encoded audio bytes (empty on the final marker).
        audio: String,
        /// Position within the response; strictly increasing.
        ordinal: u64,
        /// Marks the last chunk of the current response.
        is_final: bool,
    },
    /// The structured profile after a successful field merge.
    StructuredUpdate(serde_json::Value),
    /// All required fields collected; the client should start the
    /// document verification flow. Sent at most once per session.
    DocumentVerificationRequired {
        /// Durable application record id.
        application_id: Uuid,
        /// Profile snapshot at request time.
        structured_data: serde_json::Value,
    },
    /// Eligibility scoring result. Sent at most once per session.
    EligibilityResult {
        /// Score in [0, 1].
        score: f64,
        /// Categorical status.
        status: EligibilityStatus,
        /// Free-text recommendations.
        recommendations: Vec<String>,
        /// The sentence spoken to the applicant.
        message: String,
    },
    /// Non-fatal backend failure; the session stays open.
    Error(String),
    /// The session ended; no further events follow.
    SessionClosed,
}

/// Control messages received from the client (text frames).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Typed free-text input, treated like a final transcript.
    TextInput(String),
    /// The out-of-band document verification flow finished.
    DocumentVerificationComplete,
    /// Client-requested session end.
    EndSession,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn server_events_use_type_data_framing() {
        let event = ServerEvent::FinalTranscript("hello".to_owned());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "final_transcript");
        assert_eq!(json["data"], "hello");

        let event = ServerEvent::AudioChunk {
            audio: "QUJD".to_owned(),
            ordinal: 2,
            is_final: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "audio_chunk");
        assert_eq!(json["data"]["ordinal"], 2);
    }

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"text_input","data":"my income is 4000"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::TextInput(t) if t == "my income is 4000"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"document_verification_complete"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::DocumentVerificationComplete));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"end_session"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::EndSession));
    }
}
