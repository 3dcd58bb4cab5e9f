//! LoanVoice: real-time streaming voice agent for loan eligibility intake.
//!
//! This crate provides a cascaded pipeline for voice conversations:
//! Client audio → ASR → dialogue state machine → LLM → TTS → client audio
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by async channels:
//! - **Transport**: A WebSocket carries binary audio up and JSON events down
//! - **ASR**: Streams frames to a Deepgram-style recognition backend
//! - **Dialogue**: Slot-filling controller collecting the loan application
//! - **LLM**: Streams tokens over SSE, with the structured field payload
//!   demultiplexed out of the same stream
//! - **TTS**: Synthesizes sentences concurrently, delivered in order
//!
//! A turn in flight is cancelled the moment a newer user utterance arrives,
//! so the agent never talks over the caller.

pub mod asr;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod extract;
pub mod llm;
pub mod pipeline;
pub mod protocol;
pub mod scoring;
pub mod segment;
pub mod server;
pub mod session;
pub mod store;
pub mod tts;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use pipeline::{InboundMessage, SessionSupervisor};
pub use protocol::{ClientMessage, ServerEvent};
pub use session::{Session, SessionRegistry};
