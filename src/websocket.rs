//! # Conversation WebSocket
//!
//! Full-duplex voice conversation over `/ws/conversation`. Each connection is
//! one actor bound to one session; the actor mailbox is the ordered path for
//! everything that touches that session.
//!
//! ## WebSocket Protocol:
//! 1. **Start**: client sends `{"type": "start", "session_id": ..., "sample_rate": ...}`;
//!    both fields are optional. A known `session_id` attaches to a session
//!    created through the HTTP API.
//! 2. **Audio**: binary frames of PCM16 LE mono. Stream time is derived from
//!    the number of samples received so far.
//! 3. **Turns**: the server reports `speech_started`, `speech_ended`,
//!    `transcript`, `agent_response` (followed by the reply as binary PCM16),
//!    `interrupt` and `turn_complete`.
//! 4. **Playback**: the client sends `playback_complete` when it finishes
//!    playing a reply; otherwise the reply is assumed done after its duration.
//! 5. **Control**: `reset`, `ping`, `end`.
//!
//! ## Downstream Work:
//! Handed-off utterances are processed on spawned tasks holding no lock.
//! Results come back as actor messages and are applied to the session, which
//! ignores results for turns that are no longer current.

use crate::audio::buffer::AudioChunk;
use crate::audio::processor::{decode_pcm16, encode_pcm16, AudioConfig};
use crate::conversation::{ConversationState, Transition};
use crate::downstream::TurnResult;
use crate::error::SessionError;
use crate::session::{Interrupt, Session, SessionCallbacks, SpeechStart, TurnOutcome, Utterance};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Control messages from the client.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start {
        session_id: Option<String>,
        sample_rate: Option<u32>,
    },
    End,
    Ping {
        timestamp: u64,
    },
    PlaybackComplete,
    Reset,
}

/// Events sent to the client as JSON text frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        session_id: String,
        sample_rate: u32,
        attached: bool,
    },
    StateChanged {
        session_id: String,
        from: ConversationState,
        to: ConversationState,
    },
    SpeechStarted {
        session_id: String,
        start_time: f64,
        barge_in: bool,
    },
    SpeechEnded {
        session_id: String,
        turn_id: u64,
        start_time: f64,
        end_time: f64,
    },
    Transcript {
        session_id: String,
        turn_id: u64,
        text: String,
    },
    AgentResponse {
        session_id: String,
        turn_id: u64,
        text: String,
        audio_seconds: f64,
    },
    Interrupt {
        session_id: String,
        turn_id: u64,
        detected_at: f64,
    },
    TurnComplete {
        session_id: String,
        turn_id: u64,
        success: bool,
        interrupted: bool,
        error: Option<String>,
        latency_ms: Option<f64>,
    },
    SessionEnded {
        session_id: String,
    },
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },
    Pong {
        timestamp: u64,
    },
}

/// Session callbacks, delivered back into the actor.
#[derive(Message)]
#[rtype(result = "()")]
enum SessionNotice {
    StateChanged(Transition),
    SpeechStarted(SpeechStart),
    Interrupt(Interrupt),
    TurnComplete(TurnOutcome),
}

/// An utterance handed off by the session.
#[derive(Message)]
#[rtype(result = "()")]
struct DispatchTurn(Utterance);

/// Result of a downstream task.
#[derive(Message)]
#[rtype(result = "()")]
struct TurnFinished(TurnResult);

/// Stream time in seconds of the next sample.
pub fn stream_time(samples_received: u64, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    samples_received as f64 / sample_rate as f64
}

struct Playback {
    turn_id: u64,
    handle: SpawnHandle,
}

/// A session bound to one connection by `start`.
#[derive(Debug)]
struct ClaimedSession {
    session: Arc<Session>,
    /// True when the session already existed (created through the HTTP API).
    attached: bool,
    sample_rate: u32,
}

#[derive(Debug, PartialEq)]
struct StartRejected {
    code: &'static str,
    message: String,
}

impl StartRejected {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Attach to the named session or create a new one, and claim it as this
/// connection's only writer.
///
/// An existing session keeps its own sample rate, so the declared format is
/// checked against that rather than the current server default.
fn claim_session(
    state: &AppState,
    session_id: Option<String>,
    sample_rate: Option<u32>,
    callbacks: SessionCallbacks,
) -> Result<ClaimedSession, StartRejected> {
    let format = state.get_config().audio_format();
    let existing = session_id
        .as_deref()
        .and_then(|id| state.sessions.get_session(id));

    let check_format = |expected_rate: u32| {
        let expected = AudioConfig::new(expected_rate, format.channels, format.bit_depth);
        AudioConfig::new(sample_rate.unwrap_or(expected_rate), format.channels, format.bit_depth)
            .ensure_matches(&expected)
            .map(|()| expected_rate)
            .map_err(|err| StartRejected::new("unsupported_format", err.to_string()))
    };

    match existing {
        Some(session) => {
            let rate = check_format(session.lock().config().sample_rate)?;
            if !session.try_attach() {
                return Err(StartRejected::new(
                    "session_busy",
                    format!("Session {} is already streaming on another connection", session.id()),
                ));
            }
            session.lock().replace_callbacks(callbacks);
            Ok(ClaimedSession {
                session,
                attached: true,
                sample_rate: rate,
            })
        }
        None => {
            let rate = check_format(format.sample_rate)?;
            let session = state
                .sessions
                .create_session(session_id, callbacks)
                .map_err(|err| {
                    let code = match &err {
                        SessionError::LimitReached(_) => "capacity",
                        SessionError::Duplicate(_) => "duplicate_session",
                        SessionError::NotFound(_) => "not_found",
                    };
                    StartRejected::new(code, err.to_string())
                })?;
            if !session.try_attach() {
                return Err(StartRejected::new("session_busy", "Session was claimed concurrently"));
            }
            Ok(ClaimedSession {
                session,
                attached: false,
                sample_rate: rate,
            })
        }
    }
}

pub struct ConversationWebSocket {
    state: AppState,
    session: Option<Arc<Session>>,
    /// Whether this connection created the session (and so removes it on close).
    owns_session: bool,
    sample_rate: u32,
    samples_received: u64,
    playback: Option<Playback>,
    last_heartbeat: Instant,
}

impl ConversationWebSocket {
    pub fn new(state: AppState) -> Self {
        let sample_rate = state.get_config().audio.sample_rate;
        Self {
            state,
            session: None,
            owns_session: false,
            sample_rate,
            samples_received: 0,
            playback: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.id().to_string())
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize server message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(session_id = ?self.session_id(), code, message, "WebSocket error");
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
                session_id: self.session_id(),
            },
        );
    }

    fn callbacks(addr: Addr<Self>) -> SessionCallbacks {
        let (a1, a2, a3, a4) = (addr.clone(), addr.clone(), addr.clone(), addr.clone());
        SessionCallbacks::new()
            .on_state_change(move |t| a1.do_send(SessionNotice::StateChanged(t)))
            .on_speech_start(move |s| a2.do_send(SessionNotice::SpeechStarted(s)))
            .on_speech_end(move |u| a3.do_send(DispatchTurn(u)))
            .on_interrupt(move |i| a4.do_send(SessionNotice::Interrupt(i)))
            .on_turn_complete(move |o| addr.do_send(SessionNotice::TurnComplete(o)))
    }

    fn handle_start(
        &mut self,
        session_id: Option<String>,
        sample_rate: Option<u32>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if self.session.is_some() {
            self.send_error(ctx, "already_started", "Session already started on this connection");
            return;
        }

        let callbacks = Self::callbacks(ctx.address());
        let claimed = match claim_session(&self.state, session_id, sample_rate, callbacks) {
            Ok(claimed) => claimed,
            Err(rejected) => {
                self.send_error(ctx, rejected.code, &rejected.message);
                return;
            }
        };

        let session = claimed.session;
        info!(session_id = %session.id(), attached = claimed.attached, "Conversation started");
        self.sample_rate = claimed.sample_rate;
        self.samples_received = 0;
        self.owns_session = !claimed.attached;
        self.send(
            ctx,
            &ServerMessage::SessionStarted {
                session_id: session.id().to_string(),
                sample_rate: self.sample_rate,
                attached: claimed.attached,
            },
        );
        self.session = Some(session);
    }

    fn handle_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.session.clone() else {
            self.send_error(ctx, "not_started", "Send a start message before audio");
            return;
        };
        if self.state.sessions.get_session(session.id()).is_none() {
            self.send_error(ctx, "session_closed", "Session was closed by the server");
            self.session = None;
            ctx.stop();
            return;
        }

        let samples = match decode_pcm16(data) {
            Ok(samples) => samples,
            Err(err) => {
                self.send_error(ctx, "audio_format", &err.to_string());
                return;
            }
        };

        let timestamp = stream_time(self.samples_received, self.sample_rate);
        self.samples_received += samples.len() as u64;
        let chunk = AudioChunk::new(timestamp, samples, self.sample_rate);

        if let Err(err) = session.process_audio_chunk(chunk) {
            self.send_error(ctx, "audio_format", &err.to_string());
        }
    }

    fn stop_playback(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(playback) = self.playback.take() {
            ctx.cancel_future(playback.handle);
        }
    }

    /// Mark the reply for `turn_id` as fully played.
    fn finish_playback(&mut self, turn_id: u64) {
        self.playback = None;
        if let Some(session) = &self.session {
            session.lock().end_agent_speech(turn_id);
        }
    }

    fn handle_turn_result(&mut self, result: TurnResult, ctx: &mut ws::WebsocketContext<Self>) {
        let (Some(session), Some(session_id)) = (self.session.clone(), self.session_id()) else {
            return;
        };

        match result {
            TurnResult::Ready(reply) => {
                if !session.lock().begin_agent_speech(reply.turn_id) {
                    debug!(session_id = %session_id, turn_id = reply.turn_id, "Dropping stale reply");
                    return;
                }

                self.send(
                    ctx,
                    &ServerMessage::Transcript {
                        session_id: session_id.clone(),
                        turn_id: reply.turn_id,
                        text: reply.transcript,
                    },
                );
                self.send(
                    ctx,
                    &ServerMessage::AgentResponse {
                        session_id,
                        turn_id: reply.turn_id,
                        text: reply.response,
                        audio_seconds: reply.audio.duration(),
                    },
                );
                ctx.binary(encode_pcm16(&reply.audio.samples));

                let turn_id = reply.turn_id;
                let handle = ctx.run_later(
                    Duration::from_secs_f64(reply.audio.duration()),
                    move |act, _ctx| act.finish_playback(turn_id),
                );
                self.stop_playback(ctx);
                self.playback = Some(Playback { turn_id, handle });
            }
            TurnResult::Failed { turn_id, error } => {
                session.lock().fail_turn(turn_id, error);
            }
            TurnResult::Cancelled { turn_id } => {
                debug!(session_id = %session_id, turn_id, "Turn cancelled");
            }
        }
    }

    fn handle_control(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::Start {
                session_id,
                sample_rate,
            } => self.handle_start(session_id, sample_rate, ctx),
            ClientMessage::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                self.send(ctx, &ServerMessage::Pong { timestamp });
            }
            ClientMessage::PlaybackComplete => match self.playback.take() {
                Some(playback) => {
                    ctx.cancel_future(playback.handle);
                    self.finish_playback(playback.turn_id);
                }
                None => debug!(session_id = ?self.session_id(), "No reply is playing"),
            },
            ClientMessage::Reset => {
                self.stop_playback(ctx);
                match &self.session {
                    Some(session) => session.lock().reset(),
                    None => self.send_error(ctx, "not_started", "No session to reset"),
                }
            }
            ClientMessage::End => {
                self.stop_playback(ctx);
                if let Some(session) = self.session.take() {
                    self.state.sessions.remove_session(session.id());
                    self.send(
                        ctx,
                        &ServerMessage::SessionEnded {
                            session_id: session.id().to_string(),
                        },
                    );
                }
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }
}

impl Actor for ConversationWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.connection_opened();
        debug!("Conversation socket opened");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = ?act.session_id(), "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.connection_closed();

        let Some(session) = self.session.take() else {
            return;
        };
        if self.owns_session {
            self.state.sessions.remove_session(session.id());
        } else {
            // Leave API-created sessions registered, but stop talking to this socket.
            {
                let mut realtime = session.lock();
                realtime.replace_callbacks(SessionCallbacks::new());
                realtime.reset();
            }
            session.detach();
        }
        info!(session_id = %session.id(), "Conversation socket closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConversationWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_control(message, ctx),
                Err(err) => self.send_error(ctx, "invalid_message", &format!("Invalid message: {}", err)),
            },
            Ok(ws::Message::Binary(data)) => self.handle_audio(&data, ctx),
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<SessionNotice> for ConversationWebSocket {
    type Result = ();

    fn handle(&mut self, notice: SessionNotice, ctx: &mut Self::Context) {
        let Some(session_id) = self.session_id() else {
            return;
        };

        let message = match notice {
            SessionNotice::StateChanged(transition) => ServerMessage::StateChanged {
                session_id,
                from: transition.from,
                to: transition.to,
            },
            SessionNotice::SpeechStarted(start) => ServerMessage::SpeechStarted {
                session_id,
                start_time: start.start_time,
                barge_in: start.barge_in,
            },
            SessionNotice::Interrupt(interrupt) => {
                self.stop_playback(ctx);
                let pipeline = Arc::clone(&self.state.pipeline);
                let id = session_id.clone();
                tokio::spawn(async move { pipeline.stop_speech(&id).await });
                ServerMessage::Interrupt {
                    session_id,
                    turn_id: interrupt.turn_id,
                    detected_at: interrupt.detected_at,
                }
            }
            SessionNotice::TurnComplete(outcome) => ServerMessage::TurnComplete {
                session_id,
                turn_id: outcome.turn_id,
                success: outcome.success,
                interrupted: outcome.interrupted,
                error: outcome.error.map(|e| e.to_string()),
                latency_ms: outcome.latency_ms,
            },
        };
        self.send(ctx, &message);
    }
}

impl Handler<DispatchTurn> for ConversationWebSocket {
    type Result = ();

    fn handle(&mut self, DispatchTurn(utterance): DispatchTurn, ctx: &mut Self::Context) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let session_id = session.id().to_string();
        self.send(
            ctx,
            &ServerMessage::SpeechEnded {
                session_id: session_id.clone(),
                turn_id: utterance.turn_id,
                start_time: utterance.start_time,
                end_time: utterance.end_time,
            },
        );

        let timeout = session.lock().config().processing_timeout();
        let pipeline = Arc::clone(&self.state.pipeline);
        let addr = ctx.address();
        tokio::spawn(async move {
            let result = pipeline.run_turn(session_id, utterance, timeout).await;
            addr.do_send(TurnFinished(result));
        });
    }
}

impl Handler<TurnFinished> for ConversationWebSocket {
    type Result = ();

    fn handle(&mut self, TurnFinished(result): TurnFinished, ctx: &mut Self::Context) {
        self.handle_turn_result(result, ctx);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a `ConversationWebSocket` actor.
pub async fn conversation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "New conversation connection");
    ws::start(ConversationWebSocket::new(state.get_ref().clone()), &req, stream)
}
