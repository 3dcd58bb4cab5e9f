//! The streaming voice pipeline: typed stage messages plus the session
//! supervisor that wires recognizer, model and synthesizer together.

pub mod messages;
pub mod supervisor;

pub use messages::{
    AudioFrame, ChatTurn, SentenceChunk, Speaker, SynthesizedChunk, TokenEvent, TranscriptEvent,
};
pub use supervisor::{InboundMessage, SessionSupervisor};
