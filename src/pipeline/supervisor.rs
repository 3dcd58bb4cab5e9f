//! Session supervisor: owns per-session concurrency.
//!
//! Each live session runs a small set of cooperative tasks sharing the
//! session state: an ingress task feeding the recognizer, the main loop
//! converting recognizer events into dialogue decisions, and, per turn,
//! one response task (LLM -> extraction -> TTS). Starting a new turn
//! always cancels and awaits the previous response task first, so at
//! most one response pipeline is ever live and no stale audio can be
//! emitted after a newer turn has started.

use crate::asr::{run_audio_ingress, SpeechRecognizer, TranscriptFilter};
use crate::config::AgentConfig;
use crate::dialogue::{DialogueController, TurnDecision};
use crate::error::Result;
use crate::extract::merge_payload;
use crate::llm::{DemuxEvent, ResponseGenerator, TokenDemux};
use crate::pipeline::messages::{AudioFrame, SentenceChunk, SynthesizedChunk, TranscriptEvent};
use crate::protocol::{ClientMessage, ServerEvent};
use crate::segment::{run_tts_dispatcher, SentenceSegmenter};
use crate::session::{PendingResponse, Session, SessionRegistry, TurnState};
use crate::tts::SpeechSynthesizer;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Channel buffer sizes.
const FRAME_CHANNEL_SIZE: usize = 64;
const SENTENCE_CHANNEL_SIZE: usize = 8;
const SYNTH_CHANNEL_SIZE: usize = 16;

/// One message from the client transport.
#[derive(Debug)]
pub enum InboundMessage {
    /// A binary audio frame.
    Audio(AudioFrame),
    /// A parsed JSON control message.
    Control(ClientMessage),
}

/// Orchestrates one session end to end.
///
/// Backends are trait objects so deployments can swap recognizer, model
/// and synthesizer implementations without touching the orchestration.
pub struct SessionSupervisor {
    config: AgentConfig,
    recognizer: Arc<dyn SpeechRecognizer>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    controller: Arc<DialogueController>,
    registry: Arc<SessionRegistry>,
}

impl SessionSupervisor {
    /// Create a supervisor for the given backends.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        recognizer: Arc<dyn SpeechRecognizer>,
        generator: Arc<dyn ResponseGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        controller: Arc<DialogueController>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            recognizer,
            generator,
            synthesizer,
            controller,
            registry,
        }
    }

    /// Live-session registry (shared with the server surface).
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run one session until the transport closes or the client ends it.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable transport-level failures;
    /// backend failures become `error` events and the session continues.
    pub async fn run_session(
        &self,
        session_id: uuid::Uuid,
        inbound: mpsc::Receiver<InboundMessage>,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        self.registry.register(session_id, cancel.clone());
        info!("voice session started: {session_id}");

        let result = self
            .session_loop(session_id, inbound, &outbound, &cancel)
            .await;

        cancel.cancel();
        let _ = outbound.send(ServerEvent::SessionClosed).await;
        self.registry.remove(session_id);
        info!("voice session ended: {session_id}");
        result
    }

    async fn session_loop(
        &self,
        session_id: uuid::Uuid,
        mut inbound: mpsc::Receiver<InboundMessage>,
        outbound: &mpsc::Sender<ServerEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session = Arc::new(Mutex::new(Session::new(session_id)));
        let mut filter = TranscriptFilter::default();
        let mut pending: Option<PendingResponse> = None;
        let mut reconnects: u32 = 0;

        // When no recognizer is available, `events` is parked on a
        // channel whose sender we hold, so the select arm stays pending
        // instead of spinning on a closed channel.
        let (mut frame_tx, mut events, mut parked_tx) =
            match self.connect_recognizer(cancel, outbound).await {
                Some((tx, rx)) => (tx, rx, None),
                None => {
                    let (ptx, prx) = mpsc::channel(1);
                    let (ftx, _) = mpsc::channel(1);
                    (ftx, prx, Some(ptx))
                }
            };

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                msg = inbound.recv() => match msg {
                    None => break,
                    Some(InboundMessage::Audio(frame)) => {
                        {
                            let mut s = session.lock().await;
                            if s.turn_state == TurnState::Idle {
                                s.turn_state = TurnState::Listening;
                            }
                        }
                        // A closed ingress is handled by the recognizer
                        // reconnect path, not here.
                        let _ = frame_tx.send(frame).await;
                    }
                    Some(InboundMessage::Control(ClientMessage::TextInput(text))) => {
                        let text = text.trim().to_owned();
                        if text.is_empty() {
                            continue;
                        }
                        filter.note(&text);
                        let _ = outbound
                            .send(ServerEvent::FinalTranscript(text.clone()))
                            .await;
                        self.start_turn(&session, &mut pending, outbound, cancel, &text)
                            .await;
                    }
                    Some(InboundMessage::Control(ClientMessage::DocumentVerificationComplete)) => {
                        self.handle_documents_verified(&session, &mut pending, outbound, cancel)
                            .await;
                    }
                    Some(InboundMessage::Control(ClientMessage::EndSession)) => break,
                },

                event = events.recv() => match event {
                    Some(TranscriptEvent { text, is_final: false, .. }) => {
                        let _ = outbound.send(ServerEvent::InterimTranscript(text)).await;
                    }
                    Some(TranscriptEvent { text, .. }) => {
                        {
                            let mut s = session.lock().await;
                            if s.turn_state == TurnState::Listening {
                                s.turn_state = TurnState::Recognizing;
                            }
                        }
                        if let Some(text) = filter.accept(&text) {
                            let _ = outbound
                                .send(ServerEvent::FinalTranscript(text.clone()))
                                .await;
                            self.start_turn(&session, &mut pending, outbound, cancel, &text)
                                .await;
                        }
                    }
                    None => {
                        // Recognizer connection ended; reconnect with a
                        // bound so a dead backend cannot loop forever.
                        reconnects += 1;
                        if reconnects > self.config.asr.max_reconnects {
                            warn!("recognizer reconnect limit reached");
                            let _ = outbound
                                .send(ServerEvent::Error(
                                    "speech recognition unavailable; you can still type"
                                        .to_owned(),
                                ))
                                .await;
                            let (ptx, prx) = mpsc::channel(1);
                            parked_tx = Some(ptx);
                            events = prx;
                        } else {
                            warn!("recognizer stream ended, reconnecting ({reconnects})");
                            match self.connect_recognizer(cancel, outbound).await {
                                Some((tx, rx)) => {
                                    frame_tx = tx;
                                    events = rx;
                                }
                                None => {
                                    let (ptx, prx) = mpsc::channel(1);
                                    parked_tx = Some(ptx);
                                    events = prx;
                                }
                            }
                        }
                    }
                },
            }
        }

        drop(parked_tx);
        if let Some(p) = pending.take() {
            p.cancel_and_wait().await;
        }
        Ok(())
    }

    /// Open a recognizer stream and wire the audio ingress task to it.
    /// Returns `None` (after reporting) when the backend refuses the
    /// connection; typed input still works without it.
    async fn connect_recognizer(
        &self,
        cancel: &CancellationToken,
        outbound: &mpsc::Sender<ServerEvent>,
    ) -> Option<(
        mpsc::Sender<AudioFrame>,
        mpsc::Receiver<TranscriptEvent>,
    )> {
        match self.recognizer.start().await {
            Ok(stream) => {
                let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
                tokio::spawn(run_audio_ingress(
                    frame_rx,
                    stream.input,
                    Duration::from_millis(self.config.asr.keepalive_interval_ms),
                    cancel.child_token(),
                ));
                Some((frame_tx, stream.events))
            }
            Err(e) => {
                error!("recognizer connect failed: {e}");
                let _ = outbound
                    .send(ServerEvent::Error(format!(
                        "speech recognition unavailable: {e}"
                    )))
                    .await;
                None
            }
        }
    }

    /// Barge-in point: tear down the previous response pipeline, run the
    /// dialogue decision for the new transcript, and start its work.
    async fn start_turn(
        &self,
        session: &Arc<Mutex<Session>>,
        pending: &mut Option<PendingResponse>,
        outbound: &mpsc::Sender<ServerEvent>,
        cancel: &CancellationToken,
        text: &str,
    ) {
        if let Some(previous) = pending.take() {
            if !previous.is_finished() {
                info!("barge-in: cancelling response for turn {}", previous.turn);
                session.lock().await.turn_state = TurnState::Interrupted;
            }
            previous.cancel_and_wait().await;
            session.lock().await.turn_state = TurnState::Listening;
        }

        let decision = {
            let mut s = session.lock().await;
            match self.controller.on_final_transcript(&mut s, text).await {
                Ok(d) => d,
                Err(e) => {
                    error!("turn decision failed: {e}");
                    let _ = outbound.send(ServerEvent::Error(e.to_string())).await;
                    return;
                }
            }
        };

        match decision {
            TurnDecision::RequestVerification { application_id } => {
                let structured_data = session.lock().await.profile.snapshot();
                let _ = outbound
                    .send(ServerEvent::DocumentVerificationRequired {
                        application_id,
                        structured_data,
                    })
                    .await;
            }
            TurnDecision::ReportEligibility { outcome, message } => {
                let _ = outbound
                    .send(ServerEvent::EligibilityResult {
                        score: outcome.score,
                        status: outcome.status,
                        recommendations: outcome.recommendations,
                        message: message.clone(),
                    })
                    .await;
                let _ = outbound.send(ServerEvent::AiToken(message.clone())).await;
                *pending = Some(self.spawn_speak(session, outbound, cancel, message).await);
            }
            TurnDecision::Dispatch {
                system_prompt,
                history,
            } => {
                *pending = Some(
                    self.spawn_response(session, outbound, cancel, text, system_prompt, history)
                        .await,
                );
            }
        }
    }

    async fn handle_documents_verified(
        &self,
        session: &Arc<Mutex<Session>>,
        pending: &mut Option<PendingResponse>,
        outbound: &mpsc::Sender<ServerEvent>,
        cancel: &CancellationToken,
    ) {
        if let Some(previous) = pending.take() {
            previous.cancel_and_wait().await;
        }

        let outcome = {
            let mut s = session.lock().await;
            match self.controller.on_documents_verified(&mut s) {
                Ok(o) => o,
                Err(e) => {
                    error!("verification handling failed: {e}");
                    let _ = outbound.send(ServerEvent::Error(e.to_string())).await;
                    return;
                }
            }
        };

        if let Some(result) = outcome.result {
            let _ = outbound
                .send(ServerEvent::EligibilityResult {
                    score: result.score,
                    status: result.status,
                    recommendations: result.recommendations,
                    message: outcome.message.clone(),
                })
                .await;
        }
        let _ = outbound
            .send(ServerEvent::AiToken(outcome.message.clone()))
            .await;
        *pending = Some(
            self.spawn_speak(session, outbound, cancel, outcome.message)
                .await,
        );
    }

    /// Spawn the full LLM -> demux -> segment -> TTS pipeline for a turn.
    async fn spawn_response(
        &self,
        session: &Arc<Mutex<Session>>,
        outbound: &mpsc::Sender<ServerEvent>,
        cancel: &CancellationToken,
        user_text: &str,
        system_prompt: String,
        history: Vec<crate::pipeline::messages::ChatTurn>,
    ) -> PendingResponse {
        let turn = session.lock().await.next_turn();
        let child = cancel.child_token();
        let ctx = ResponseContext {
            session: Arc::clone(session),
            generator: Arc::clone(&self.generator),
            synthesizer: Arc::clone(&self.synthesizer),
            controller: Arc::clone(&self.controller),
            config: self.config.clone(),
            outbound: outbound.clone(),
            cancel: child.clone(),
            user_text: user_text.to_owned(),
            system_prompt,
            history,
        };
        let handle = tokio::spawn(run_response_pipeline(ctx));
        PendingResponse::new(turn, child, handle)
    }

    /// Spawn a speak-only pipeline for controller-composed messages
    /// (verification follow-ups, eligibility results).
    async fn spawn_speak(
        &self,
        session: &Arc<Mutex<Session>>,
        outbound: &mpsc::Sender<ServerEvent>,
        cancel: &CancellationToken,
        text: String,
    ) -> PendingResponse {
        let turn = session.lock().await.next_turn();
        let child = cancel.child_token();
        let session = Arc::clone(session);
        let synthesizer = Arc::clone(&self.synthesizer);
        let config = self.config.tts.clone();
        let outbound = outbound.clone();
        let task_cancel = child.clone();
        let handle = tokio::spawn(async move {
            speak_text(
                &session,
                synthesizer,
                &config,
                &outbound,
                &task_cancel,
                &text,
            )
            .await;
        });
        PendingResponse::new(turn, child, handle)
    }
}

/// Everything one response pipeline task needs.
struct ResponseContext {
    session: Arc<Mutex<Session>>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    controller: Arc<DialogueController>,
    config: AgentConfig,
    outbound: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
    user_text: String,
    system_prompt: String,
    history: Vec<crate::pipeline::messages::ChatTurn>,
}

/// The per-turn response pipeline: stream tokens from the LLM, split
/// speech from the field payload, feed sentences to TTS, then merge the
/// payload into the profile once the stream ends.
async fn run_response_pipeline(ctx: ResponseContext) {
    ctx.session.lock().await.turn_state = TurnState::Dispatched;

    // A separate token lets the role-confusion guard abort the LLM
    // request without tearing down the TTS stages mid-sentence.
    let llm_cancel = ctx.cancel.child_token();
    let mut token_rx = match ctx
        .generator
        .generate(&ctx.system_prompt, &ctx.history, llm_cancel.clone())
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            error!("LLM dispatch failed: {e}");
            let _ = ctx.outbound.send(ServerEvent::Error(e.to_string())).await;
            ctx.session.lock().await.turn_state = TurnState::Idle;
            return;
        }
    };

    let (sentence_tx, sentence_rx) = mpsc::channel::<SentenceChunk>(SENTENCE_CHANNEL_SIZE);
    let (audio_tx, audio_rx) = mpsc::channel::<SynthesizedChunk>(SYNTH_CHANNEL_SIZE);
    let tts = tokio::spawn(run_tts_dispatcher(
        Arc::clone(&ctx.synthesizer),
        ctx.config.tts.max_concurrent,
        sentence_rx,
        audio_tx,
        ctx.cancel.clone(),
    ));
    let forward = tokio::spawn(forward_audio(
        audio_rx,
        ctx.outbound.clone(),
        Arc::clone(&ctx.session),
        ctx.cancel.clone(),
    ));

    let mut demux = TokenDemux::new(&ctx.config.llm.payload_delimiter);
    let mut segmenter = SentenceSegmenter::new(ctx.config.tts.max_sentence_chars);
    let mut spoken = String::new();
    let mut interrupted = false;

    loop {
        let token = tokio::select! {
            () = ctx.cancel.cancelled() => {
                interrupted = true;
                break;
            }
            token = token_rx.recv() => token,
        };
        let Some(token) = token else { break };
        if token.is_end {
            break;
        }

        let (speech, fabricated) = match demux.push(&token.text) {
            DemuxEvent::Speech(s) => (s, false),
            DemuxEvent::FabricatedTurn(s) => (s, true),
        };
        if !speech.is_empty() {
            let _ = ctx
                .outbound
                .send(ServerEvent::AiToken(speech.clone()))
                .await;
            spoken.push_str(&speech);
            for sentence in segmenter.push(&speech) {
                let _ = sentence_tx
                    .send(SentenceChunk {
                        text: sentence,
                        is_final: false,
                    })
                    .await;
            }
        }
        if fabricated {
            warn!("model fabricated a user turn; truncating generation");
            llm_cancel.cancel();
            break;
        }
    }

    let (rest, payload) = demux.finish();
    if !interrupted {
        if !rest.is_empty() {
            let _ = ctx.outbound.send(ServerEvent::AiToken(rest.clone())).await;
            spoken.push_str(&rest);
            for sentence in segmenter.push(&rest) {
                let _ = sentence_tx
                    .send(SentenceChunk {
                        text: sentence,
                        is_final: false,
                    })
                    .await;
            }
        }
        if let Some(sentence) = segmenter.flush() {
            let _ = sentence_tx
                .send(SentenceChunk {
                    text: sentence,
                    is_final: false,
                })
                .await;
        }
        let _ = sentence_tx
            .send(SentenceChunk {
                text: String::new(),
                is_final: true,
            })
            .await;
    }
    drop(sentence_tx);

    if !interrupted && !ctx.cancel.is_cancelled() {
        let mut s = ctx.session.lock().await;
        if let Some(payload) = payload {
            let updated = merge_payload(&mut s.profile, &payload, &ctx.user_text);
            if !updated.is_empty() {
                info!("profile updated: {updated:?}");
                let _ = ctx
                    .outbound
                    .send(ServerEvent::StructuredUpdate(s.profile.snapshot()))
                    .await;
            }
        }
        let spoken = spoken.trim();
        if !spoken.is_empty() {
            s.append_assistant(spoken);
        }

        // The merge may have just completed the profile; prompt for
        // verification now instead of waiting for another utterance.
        match ctx.controller.maybe_request_verification(&mut s).await {
            Ok(Some(application_id)) => {
                let structured_data = s.profile.snapshot();
                let _ = ctx
                    .outbound
                    .send(ServerEvent::DocumentVerificationRequired {
                        application_id,
                        structured_data,
                    })
                    .await;
            }
            Ok(None) => {}
            Err(e) => error!("verification request failed: {e}"),
        }
    }

    let _ = tts.await;
    let _ = forward.await;

    let mut s = ctx.session.lock().await;
    s.turn_state = if ctx.cancel.is_cancelled() {
        TurnState::Listening
    } else {
        TurnState::Idle
    };
}

/// Forward ordered audio chunks to the transport, base64-encoded.
/// Stops immediately on cancellation so no stale audio is emitted.
async fn forward_audio(
    mut audio_rx: mpsc::Receiver<SynthesizedChunk>,
    outbound: mpsc::Sender<ServerEvent>,
    session: Arc<Mutex<Session>>,
    cancel: CancellationToken,
) {
    let mut first = true;
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => break,
            chunk = audio_rx.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };

        if first {
            session.lock().await.turn_state = TurnState::Streaming;
            first = false;
        }
        let audio = base64::engine::general_purpose::STANDARD.encode(&chunk.bytes);
        let event = ServerEvent::AudioChunk {
            audio,
            ordinal: chunk.ordinal,
            is_final: chunk.is_final,
        };
        if outbound.send(event).await.is_err() {
            break;
        }
    }
}

/// Segment and synthesize a controller-composed message (no LLM).
async fn speak_text(
    session: &Arc<Mutex<Session>>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    config: &crate::config::TtsConfig,
    outbound: &mpsc::Sender<ServerEvent>,
    cancel: &CancellationToken,
    text: &str,
) {
    let (sentence_tx, sentence_rx) = mpsc::channel::<SentenceChunk>(SENTENCE_CHANNEL_SIZE);
    let (audio_tx, audio_rx) = mpsc::channel::<SynthesizedChunk>(SYNTH_CHANNEL_SIZE);
    let tts = tokio::spawn(run_tts_dispatcher(
        synthesizer,
        config.max_concurrent,
        sentence_rx,
        audio_tx,
        cancel.clone(),
    ));
    let forward = tokio::spawn(forward_audio(
        audio_rx,
        outbound.clone(),
        Arc::clone(session),
        cancel.clone(),
    ));

    let mut segmenter = SentenceSegmenter::new(config.max_sentence_chars);
    for sentence in segmenter.push(text) {
        let _ = sentence_tx
            .send(SentenceChunk {
                text: sentence,
                is_final: false,
            })
            .await;
    }
    if let Some(sentence) = segmenter.flush() {
        let _ = sentence_tx
            .send(SentenceChunk {
                text: sentence,
                is_final: false,
            })
            .await;
    }
    let _ = sentence_tx
        .send(SentenceChunk {
            text: String::new(),
            is_final: true,
        })
        .await;
    drop(sentence_tx);

    let _ = tts.await;
    let _ = forward.await;

    let mut s = session.lock().await;
    s.turn_state = if cancel.is_cancelled() {
        TurnState::Listening
    } else {
        TurnState::Idle
    };
}
