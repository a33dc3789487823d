//! The turn controller: per-session state machine and dataflow scheduler.
//!
//! Runs as a single actor task that owns all session-local state and
//! `select!`s over three inputs: client commands, STT events, and events from
//! the transient LLM producer / TTS consumer tasks it spawns per turn. Input
//! is conservative (buffered, debounced); output is aggressive (streamed,
//! interruptible).

use crate::audio::{AudioInputBuffer, decode_audio_base64, encode_audio_base64};
use crate::config::TurnConfig;
use crate::history::ConversationHistory;
use crate::llm::{ChatMessage, LanguageModel, Role, SentenceChunk};
use crate::silence::SilenceTimer;
use crate::state::{StateMachine, TurnState};
use crate::stt::{SpeechToText, SttEvent};
use crate::transcript::TranscriptBuffer;
use crate::tts::TextToSpeech;
use crate::turn::events::{ErrorCode, Telemetry, TurnEvent, TurnRecord};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sentence queue capacity between the LLM producer and the TTS consumer.
const SENTENCE_CHANNEL_SIZE: usize = 64;

/// Fixed system prompt instructing concise, speech-friendly output.
const SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Keep responses concise and \
     natural for speech. Use conversation history for context, but answer only the latest \
     user request. Do NOT repeat or restate previous assistant replies.";

/// Live-tunable controller settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsUpdate {
    pub silence_debounce_ms: Option<u64>,
    pub cancellation_threshold: Option<f32>,
    pub adaptive_debounce_enabled: Option<bool>,
}

/// Commands from the client transport.
enum Command {
    AudioChunk {
        audio_b64: String,
        format: String,
        sample_rate: u32,
    },
    FinalTranscript {
        text: String,
        confidence: f32,
    },
    Interrupt,
    PlaybackComplete,
    UpdateSettings(SettingsUpdate),
    Telemetry(oneshot::Sender<Telemetry>),
    Stop,
}

/// Events from the per-turn producer/consumer tasks.
enum TaskEvent {
    Llm { run_id: u64, event: LlmTaskEvent },
    Tts { run_id: u64, event: TtsTaskEvent },
    PlaybackDeadline { generation: u64 },
}

enum LlmTaskEvent {
    Sentence(SentenceChunk),
    Done,
    TimedOut,
    Failed(String),
}

enum TtsTaskEvent {
    Audio(Bytes),
    StreamEnd,
    QueueTimedOut,
    Failed(String),
}

/// Cloneable handle exposing the controller's public operations.
#[derive(Clone)]
pub struct TurnHandle {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl TurnHandle {
    /// Route one base64 audio chunk from the client.
    pub fn audio_chunk(&self, audio_b64: String, format: String, sample_rate: u32) {
        let _ = self.command_tx.send(Command::AudioChunk {
            audio_b64,
            format,
            sample_rate,
        });
    }

    /// Inject a final transcript directly (text input, tests).
    pub fn final_transcript(&self, text: String, confidence: f32) {
        let _ = self
            .command_tx
            .send(Command::FinalTranscript { text, confidence });
    }

    /// Client-initiated barge-in.
    pub fn interrupt(&self) {
        let _ = self.command_tx.send(Command::Interrupt);
    }

    /// Client signal that rendered audio has finished playing.
    pub fn playback_complete(&self) {
        let _ = self.command_tx.send(Command::PlaybackComplete);
    }

    /// Apply live tuning changes.
    pub fn update_settings(&self, update: SettingsUpdate) {
        let _ = self.command_tx.send(Command::UpdateSettings(update));
    }

    /// Snapshot the session's tuning metrics.
    pub async fn telemetry(&self) -> Option<Telemetry> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx.send(Command::Telemetry(reply_tx)).ok()?;
        reply_rx.await.ok()
    }

    /// Disconnect the STT provider and stop the controller.
    pub fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop);
    }
}

/// Per-turn phase timestamps, captured for diagnostics only.
#[derive(Debug, Default)]
struct TurnTimings {
    speech_end: Option<Instant>,
    llm_start: Option<Instant>,
    llm_end: Option<Instant>,
    tts_start: Option<Instant>,
    first_audio: Option<Instant>,
}

impl TurnTimings {
    fn log_summary(&self) {
        let (Some(speech_end), Some(llm_start), Some(llm_end), Some(tts_start), Some(first_audio)) = (
            self.speech_end,
            self.llm_start,
            self.llm_end,
            self.tts_start,
            self.first_audio,
        ) else {
            return;
        };
        info!(
            "turn timing: speech->llm {}ms, llm {}ms, llm->tts {}ms, tts->audio {}ms, total {}ms",
            llm_start.duration_since(speech_end).as_millis(),
            llm_end.duration_since(llm_start).as_millis(),
            tts_start.saturating_duration_since(llm_end).as_millis(),
            first_audio.duration_since(tts_start).as_millis(),
            first_audio.duration_since(speech_end).as_millis(),
        );
    }
}

/// Orchestrates turn-taking between the user and the agent for one session.
pub struct TurnController {
    session_id: String,
    config: TurnConfig,
    events: mpsc::UnboundedSender<TurnEvent>,

    stt: Box<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,

    state: StateMachine,
    transcript: TranscriptBuffer,
    audio_buffer: AudioInputBuffer,
    history: ConversationHistory,
    silence: SilenceTimer,

    command_rx: mpsc::UnboundedReceiver<Command>,
    stt_tx: mpsc::UnboundedSender<SttEvent>,
    stt_rx: mpsc::UnboundedReceiver<SttEvent>,
    silence_rx: mpsc::UnboundedReceiver<u64>,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
    task_rx: mpsc::UnboundedReceiver<TaskEvent>,

    llm_cancel: CancellationToken,
    tts_cancel: CancellationToken,
    active_run: Option<u64>,
    next_run_id: u64,
    llm_task: Option<JoinHandle<()>>,
    tts_task: Option<JoinHandle<()>>,
    sentence_tx: Option<mpsc::Sender<SentenceChunk>>,
    sentence_rx: Option<mpsc::Receiver<SentenceChunk>>,

    turn_start_time: Option<Instant>,
    agent_sentences: Vec<String>,
    first_sentence_seen: bool,
    llm_sent_final: bool,
    chunk_index: u64,
    audio_chunks_sent: u64,
    waiting_for_playback: bool,
    turn_complete_sent: bool,
    playback_generation: u64,
    playback_task: Option<JoinHandle<()>>,
    timings: TurnTimings,

    total_turns: u64,
    cancelled_turns: u64,
    interruption_count: u64,
    tokens_wasted: u64,
    ignored_transcripts: u64,
}

impl TurnController {
    /// Create a controller and its command handle.
    pub fn new(
        session_id: impl Into<String>,
        config: &TurnConfig,
        stt: Box<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        events: mpsc::UnboundedSender<TurnEvent>,
    ) -> (Self, TurnHandle) {
        let session_id = session_id.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (stt_tx, stt_rx) = mpsc::unbounded_channel();
        let (silence_tx, silence_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();

        info!("turn controller created for session {session_id}");

        let controller = Self {
            session_id,
            config: config.clone(),
            events,
            stt,
            llm,
            tts,
            state: StateMachine::new(),
            transcript: TranscriptBuffer::new(),
            audio_buffer: AudioInputBuffer::new(
                config.max_audio_buffer_secs,
                config.audio_sample_rate,
            ),
            history: ConversationHistory::new(config.history_max_turns),
            silence: SilenceTimer::new(config, silence_tx),
            command_rx,
            stt_tx,
            stt_rx,
            silence_rx,
            task_tx,
            task_rx,
            llm_cancel: CancellationToken::new(),
            tts_cancel: CancellationToken::new(),
            active_run: None,
            next_run_id: 0,
            llm_task: None,
            tts_task: None,
            sentence_tx: None,
            sentence_rx: None,
            turn_start_time: None,
            agent_sentences: Vec::new(),
            first_sentence_seen: false,
            llm_sent_final: false,
            chunk_index: 0,
            audio_chunks_sent: 0,
            waiting_for_playback: false,
            turn_complete_sent: false,
            playback_generation: 0,
            playback_task: None,
            timings: TurnTimings::default(),
            total_turns: 0,
            cancelled_turns: 0,
            interruption_count: 0,
            tokens_wasted: 0,
            ignored_transcripts: 0,
        };
        (controller, TurnHandle { command_tx })
    }

    /// Connect the STT provider and run the session loop until stopped.
    pub async fn run(mut self) {
        if let Err(e) = self.stt.connect(self.stt_tx.clone()).await {
            warn!("initial STT connection failed: {e}");
            self.emit_error(
                ErrorCode::SttConnectionFailed,
                format!("failed to connect to transcription service: {e}"),
                true,
            );
        }
        info!("turn controller started for session {}", self.session_id);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(Command::Stop) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(event) = self.stt_rx.recv() => self.handle_stt_event(event).await,
                Some(generation) = self.silence_rx.recv() => {
                    self.handle_silence_fire(generation);
                }
                Some(event) = self.task_rx.recv() => self.handle_task_event(event).await,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.stt.disconnect().await;
        self.silence.cancel();
        self.llm_cancel.cancel();
        self.tts_cancel.cancel();
        self.await_generation_tasks().await;
        self.disarm_playback();
        if self.ignored_transcripts > 0 {
            debug!(
                "{} transcripts ignored in non-active states this session",
                self.ignored_transcripts
            );
        }
        info!("turn controller stopped for session {}", self.session_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AudioChunk {
                audio_b64,
                format,
                sample_rate,
            } => self.handle_audio_chunk(&audio_b64, &format, sample_rate).await,
            Command::FinalTranscript { text, confidence } => {
                self.handle_final_transcript(text, confidence);
            }
            Command::Interrupt => self.handle_interrupt().await,
            Command::PlaybackComplete => self.handle_playback_complete().await,
            Command::UpdateSettings(update) => self.apply_settings(update),
            Command::Telemetry(reply) => {
                let _ = reply.send(self.telemetry());
            }
            // Handled by the run loop before dispatch.
            Command::Stop => {}
        }
    }

    async fn handle_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::Partial { text, confidence } => {
                self.handle_partial_transcript(text, confidence).await;
            }
            SttEvent::Final { text, confidence } => self.handle_final_transcript(text, confidence),
            SttEvent::Error {
                message,
                recoverable,
            } => self.emit_error(ErrorCode::SttTransportLost, message, recoverable),
        }
    }

    /// Route one decoded client audio chunk: forwarded to STT in every
    /// active state so barge-in detection keeps working, buffered only while
    /// listening.
    async fn handle_audio_chunk(&mut self, audio_b64: &str, format: &str, sample_rate: u32) {
        let Some(audio) = decode_audio_base64(audio_b64) else {
            warn!("failed to decode base64 audio chunk");
            return;
        };
        if audio.is_empty() {
            warn!("empty audio chunk dropped");
            return;
        }
        debug!(
            "audio chunk: {} bytes ({format} @ {sample_rate}Hz), state {}",
            audio.len(),
            self.state.current()
        );

        match self.state.current() {
            TurnState::Idle => {
                if !self.transition(TurnState::Listening, "user audio received") {
                    return;
                }
                if self.turn_start_time.is_none() {
                    self.turn_start_time = Some(Instant::now());
                }
                self.audio_buffer.add(&audio);
            }
            TurnState::Listening => self.audio_buffer.add(&audio),
            // Forwarded for barge-in detection, but not buffered.
            TurnState::Speculative | TurnState::Committed | TurnState::Speaking => {}
        }

        self.stt.send_audio(Bytes::from(audio)).await;
    }

    async fn handle_partial_transcript(&mut self, text: String, confidence: f32) {
        match self.state.current() {
            TurnState::Idle => {
                self.ignored_transcripts += 1;
                debug!("partial transcript while idle - ignoring");
                return;
            }
            TurnState::Listening => {
                // User is still speaking; push the end-of-utterance decision out.
                if self.silence.is_armed() {
                    self.silence.start();
                }
            }
            TurnState::Speculative => {
                info!("new speech during speculation - cancelling LLM: \"{text}\"");
                self.cancel_speculation().await;
                self.transition(TurnState::Listening, "user resumed speaking");
            }
            TurnState::Committed => {
                info!("user interrupted before agent spoke: \"{text}\"");
                self.pre_speak_interrupt(true).await;
            }
            TurnState::Speaking => {
                info!("user barge-in while agent speaking: \"{text}\"");
                self.handle_barge_in().await;
            }
        }

        self.transcript.add_partial(&text);
        let _ = self
            .events
            .send(TurnEvent::TranscriptPartial { text, confidence });
    }

    fn handle_final_transcript(&mut self, text: String, confidence: f32) {
        if self.state.current() != TurnState::Listening {
            self.ignored_transcripts += 1;
            warn!(
                "final transcript in {} state - ignoring",
                self.state.current()
            );
            return;
        }

        self.transcript.add_final(&text);
        let _ = self
            .events
            .send(TurnEvent::TranscriptFinal { text, confidence });
        self.silence.start();
    }

    /// Silence dwell elapsed: the user has (probably) finished speaking.
    fn handle_silence_fire(&mut self, generation: u64) {
        if !self.silence.accept_fire(generation) {
            return;
        }
        if self.state.current() != TurnState::Listening {
            warn!(
                "silence timer fired in {} state - ignoring",
                self.state.current()
            );
            return;
        }

        self.timings.speech_end = Some(Instant::now());
        if !self.transition(TurnState::Speculative, "silence detected - starting LLM") {
            return;
        }
        self.transcript.lock();

        let user_text = self.transcript.get_final_text();
        if user_text.trim().is_empty() {
            warn!("no user text for LLM - aborting turn");
            self.reset_to_idle("no user input");
            return;
        }
        self.start_llm_run(user_text);
    }

    /// Start the speculative LLM producer for the locked transcript snapshot.
    fn start_llm_run(&mut self, user_text: String) {
        self.llm_cancel = CancellationToken::new();
        self.tts_cancel = CancellationToken::new();
        self.next_run_id += 1;
        let run_id = self.next_run_id;
        self.active_run = Some(run_id);
        self.first_sentence_seen = false;
        self.llm_sent_final = false;
        self.agent_sentences.clear();
        self.chunk_index = 0;
        self.audio_chunks_sent = 0;
        self.turn_complete_sent = false;

        let (sentence_tx, sentence_rx) = mpsc::channel(SENTENCE_CHANNEL_SIZE);
        self.sentence_tx = Some(sentence_tx);
        self.sentence_rx = Some(sentence_rx);

        let mut messages = Vec::with_capacity(self.history.len() * 2 + 2);
        messages.push(ChatMessage {
            role: Role::System,
            content: SYSTEM_PROMPT.to_owned(),
        });
        messages.extend(self.history.messages());
        messages.push(ChatMessage {
            role: Role::User,
            content: user_text,
        });

        self.timings.llm_start = Some(Instant::now());
        let llm = Arc::clone(&self.llm);
        let cancel = self.llm_cancel.clone();
        let task_tx = self.task_tx.clone();
        let budget = Duration::from_millis(self.config.llm_timeout_ms);
        self.llm_task = Some(tokio::spawn(async move {
            run_llm_producer(llm, messages, cancel, task_tx, run_id, budget).await;
        }));
    }

    async fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Llm { run_id, event } => {
                if self.active_run != Some(run_id) {
                    debug!("dropping event from stale LLM run {run_id}");
                    return;
                }
                match event {
                    LlmTaskEvent::Sentence(chunk) => self.handle_llm_sentence(chunk),
                    LlmTaskEvent::Done => self.handle_llm_done().await,
                    LlmTaskEvent::TimedOut => self.handle_llm_timeout().await,
                    LlmTaskEvent::Failed(message) => self.handle_llm_failure(message).await,
                }
            }
            TaskEvent::Tts { run_id, event } => {
                if self.active_run != Some(run_id) {
                    debug!("dropping event from stale TTS run {run_id}");
                    return;
                }
                match event {
                    TtsTaskEvent::Audio(audio) => self.handle_tts_audio(&audio),
                    TtsTaskEvent::StreamEnd => self.handle_tts_stream_end().await,
                    TtsTaskEvent::QueueTimedOut => self.handle_tts_queue_timeout().await,
                    TtsTaskEvent::Failed(reason) => self.handle_tts_failure(reason).await,
                }
            }
            TaskEvent::PlaybackDeadline { generation } => {
                self.handle_playback_deadline(generation).await;
            }
        }
    }

    fn handle_llm_sentence(&mut self, chunk: SentenceChunk) {
        if !self.first_sentence_seen {
            self.first_sentence_seen = true;
            if let Some(speech_end) = self.timings.speech_end {
                info!(
                    "first sentence ready {}ms after speech end",
                    speech_end.elapsed().as_millis()
                );
            }
            if self.state.current() == TurnState::Speculative
                && !self.transition(TurnState::Committed, "first sentence ready - starting TTS")
            {
                return;
            }
            self.spawn_tts_consumer();
        }

        self.agent_sentences.push(chunk.text.clone());
        if chunk.is_final {
            self.llm_sent_final = true;
        }
        if let Some(sentence_tx) = &self.sentence_tx
            && sentence_tx.try_send(chunk).is_err()
        {
            warn!("sentence queue full - dropping sentence");
        }
    }

    async fn handle_llm_done(&mut self) {
        self.llm_task = None;

        if !self.first_sentence_seen {
            error!("LLM returned no sentences");
            self.emit_error(
                ErrorCode::LlmNoResponse,
                "agent did not generate a response".to_owned(),
                true,
            );
            self.abort_generation().await;
            self.reset_to_idle("empty LLM response");
            return;
        }

        self.timings.llm_end = Some(Instant::now());
        if !self.llm_sent_final {
            // Sentinel: TTS learns no more sentences are coming.
            if let Some(sentence_tx) = &self.sentence_tx {
                let _ = sentence_tx.try_send(SentenceChunk {
                    text: String::new(),
                    is_final: true,
                });
            }
        }
    }

    async fn handle_llm_timeout(&mut self) {
        error!(
            "LLM streaming timeout ({}ms)",
            self.config.llm_timeout_ms
        );
        self.llm_task = None;
        self.abort_generation().await;
        self.emit_error(
            ErrorCode::LlmTimeout,
            "agent response took too long".to_owned(),
            true,
        );
        self.reset_to_idle("LLM timeout");
    }

    async fn handle_llm_failure(&mut self, message: String) {
        error!("LLM sentence streaming failed: {message}");
        self.llm_task = None;
        self.abort_generation().await;
        self.emit_error(
            ErrorCode::LlmError,
            format!("agent generation failed: {}", truncate(&message, 100)),
            true,
        );
        self.reset_to_idle("LLM error");
    }

    fn spawn_tts_consumer(&mut self) {
        let Some(run_id) = self.active_run else {
            return;
        };
        let Some(sentence_rx) = self.sentence_rx.take() else {
            return;
        };

        // Input buffering is over for this turn.
        self.audio_buffer.clear();
        self.timings.tts_start = Some(Instant::now());

        let tts = Arc::clone(&self.tts);
        let cancel = self.tts_cancel.clone();
        let task_tx = self.task_tx.clone();
        let queue_timeout = Duration::from_millis(self.config.sentence_queue_timeout_ms);
        self.tts_task = Some(tokio::spawn(async move {
            run_tts_consumer(tts, sentence_rx, cancel, task_tx, run_id, queue_timeout).await;
        }));
    }

    fn handle_tts_audio(&mut self, audio: &Bytes) {
        if self.audio_chunks_sent == 0 {
            if self.state.current() == TurnState::Committed
                && !self.transition(TurnState::Speaking, "TTS streaming started")
            {
                return;
            }
            self.timings.first_audio = Some(Instant::now());
            if let Some(speech_end) = self.timings.speech_end {
                info!(
                    "first audio chunk {}ms after speech end",
                    speech_end.elapsed().as_millis()
                );
            }
        }

        let _ = self.events.send(TurnEvent::AgentAudio {
            audio_b64: encode_audio_base64(audio),
            chunk_index: self.chunk_index,
            is_final: false,
        });
        self.chunk_index += 1;
        self.audio_chunks_sent += 1;
    }

    async fn handle_tts_stream_end(&mut self) {
        self.tts_task = None;

        if self.audio_chunks_sent == 0 {
            info!("TTS produced no audio - completing turn without playback");
            self.close_turn(false, true, true).await;
            return;
        }

        // Terminator frame, then turn_complete immediately so the UI can show
        // the agent text; the state transition waits for the playback ack.
        let _ = self.events.send(TurnEvent::AgentAudio {
            audio_b64: String::new(),
            chunk_index: self.chunk_index,
            is_final: true,
        });
        self.chunk_index += 1;

        info!(
            "TTS streaming done ({} chunks) - waiting for client playback",
            self.audio_chunks_sent
        );
        let record = self.current_turn_record(false);
        let _ = self.events.send(TurnEvent::TurnComplete(record));
        self.turn_complete_sent = true;
        self.waiting_for_playback = true;
        self.arm_playback_deadline();
    }

    async fn handle_tts_queue_timeout(&mut self) {
        self.tts_task = None;
        match self.state.current() {
            TurnState::Committed => {
                error!("sentence queue timeout - LLM stalled, forcing reset");
                self.abort_generation().await;
                self.emit_error(
                    ErrorCode::TtsQueueTimeout,
                    "agent audio generation stalled".to_owned(),
                    true,
                );
                self.reset_to_idle("sentence queue timeout");
            }
            TurnState::Speaking => {
                // Audio already went out; deliver the text we have and close.
                warn!("sentence queue timeout while speaking - falling back to text");
                self.abort_generation().await;
                self.emit_error(
                    ErrorCode::TtsQueueTimeout,
                    "agent audio generation stalled".to_owned(),
                    true,
                );
                let agent_text = self.agent_sentences.join(" ");
                if !agent_text.trim().is_empty() && !self.turn_complete_sent {
                    let _ = self.events.send(TurnEvent::AgentTextFallback {
                        text: agent_text,
                        reason: "sentence queue timeout".to_owned(),
                    });
                }
                let notify = !self.turn_complete_sent;
                self.close_turn(false, notify, true).await;
            }
            _ => debug!("sentence queue timeout in inactive state - ignoring"),
        }
    }

    async fn handle_tts_failure(&mut self, reason: String) {
        error!("TTS streaming failed: {reason}");
        self.tts_task = None;
        self.abort_generation().await;
        self.emit_error(
            ErrorCode::TtsError,
            format!("audio generation failed: {}", truncate(&reason, 100)),
            true,
        );

        let agent_text = self.agent_sentences.join(" ");
        if agent_text.trim().is_empty() {
            self.reset_to_idle("TTS failure with no agent text");
        } else {
            let _ = self.events.send(TurnEvent::AgentTextFallback {
                text: agent_text,
                reason,
            });
            let notify = !self.turn_complete_sent;
            self.close_turn(false, notify, true).await;
        }
    }

    async fn handle_playback_complete(&mut self) {
        if !self.waiting_for_playback {
            debug!("playback_complete while not waiting - ignoring");
            return;
        }
        info!("client playback complete - completing turn");
        self.waiting_for_playback = false;
        self.disarm_playback();
        self.close_turn(false, false, true).await;
    }

    async fn handle_playback_deadline(&mut self, generation: u64) {
        if generation != self.playback_generation || !self.waiting_for_playback {
            return;
        }
        warn!(
            "playback acknowledgement timeout ({}ms) - auto-completing turn",
            self.config.playback_timeout_ms
        );
        self.waiting_for_playback = false;
        self.playback_task = None;
        self.close_turn(false, false, true).await;
    }

    /// Explicit client interrupt; resolves by state like a detected barge-in.
    async fn handle_interrupt(&mut self) {
        match self.state.current() {
            TurnState::Speaking => self.handle_barge_in().await,
            TurnState::Committed => {
                info!("explicit interrupt during committed");
                self.pre_speak_interrupt(false).await;
                self.interruption_count += 1;
            }
            TurnState::Speculative => {
                info!("explicit interrupt during speculation");
                self.cancel_speculation().await;
                self.transition(TurnState::Listening, "user interrupt");
                self.interruption_count += 1;
            }
            state => debug!("interrupt ignored in {state} state"),
        }
    }

    /// Barge-in: stop the agent, close the turn as interrupted, and keep
    /// listening; the interrupting utterance starts the next turn.
    async fn handle_barge_in(&mut self) {
        info!("user interrupted agent");
        self.abort_generation().await;
        self.tokens_wasted += estimate_tokens(&self.agent_sentences);
        self.interruption_count += 1;
        self.waiting_for_playback = false;
        self.disarm_playback();
        self.transition(TurnState::Listening, "user interrupted");
        let notify = !self.turn_complete_sent;
        self.close_turn(true, notify, false).await;
    }

    /// Speculation cancel: the user resumed speaking before the first
    /// sentence arrived. The turn continues; only the LLM run is discarded.
    async fn cancel_speculation(&mut self) {
        self.abort_generation().await;
        self.tokens_wasted += estimate_tokens(&self.agent_sentences);
        self.agent_sentences.clear();
        self.first_sentence_seen = false;
        self.silence.cancel();
        self.transcript.unlock();
        self.cancelled_turns += 1;
    }

    /// Pre-speak interrupt: the user spoke (or explicitly interrupted) after
    /// commit but before any audio was produced.
    ///
    /// `resume_listening` distinguishes a detected partial (the utterance
    /// continues the same turn) from an explicit interrupt (reset to idle).
    async fn pre_speak_interrupt(&mut self, resume_listening: bool) {
        self.abort_generation().await;
        self.tokens_wasted += estimate_tokens(&self.agent_sentences);
        self.agent_sentences.clear();
        self.first_sentence_seen = false;
        self.cancelled_turns += 1;

        if resume_listening {
            self.transition(TurnState::Idle, "user interrupted before agent spoke");
            self.transcript.unlock();
            self.transition(TurnState::Listening, "user audio continues");
        } else {
            self.transcript.unlock();
            self.reset_to_idle("explicit interrupt before agent spoke");
        }
    }

    /// Cancel both generation domains and wait for their tasks to finish, so
    /// no producer outlives the decision to cancel it. Idempotent.
    async fn abort_generation(&mut self) {
        self.llm_cancel.cancel();
        self.tts_cancel.cancel();
        self.await_generation_tasks().await;
        self.drop_sentence_queue();
        self.active_run = None;
    }

    async fn await_generation_tasks(&mut self) {
        if let Some(task) = self.tts_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.llm_task.take() {
            let _ = task.await;
        }
    }

    fn drop_sentence_queue(&mut self) {
        self.sentence_tx = None;
        self.sentence_rx = None;
    }

    /// Close the current turn: record history, bump counters, emit
    /// `turn_complete` (unless already sent), and either reset to idle or,
    /// after a barge-in, stay listening with fresh per-turn state.
    async fn close_turn(&mut self, was_interrupted: bool, notify: bool, reset: bool) {
        self.timings.log_summary();
        let record = self.current_turn_record(was_interrupted);

        if !record.user_text.trim().is_empty() || !record.agent_text.trim().is_empty() {
            self.history
                .add_turn(&record.user_text, &record.agent_text);
        }
        self.total_turns += 1;
        if notify {
            let _ = self.events.send(TurnEvent::TurnComplete(record));
        }

        if reset {
            self.reset_to_idle(if was_interrupted {
                "turn interrupted"
            } else {
                "turn complete"
            });
        } else {
            self.clear_turn_state();
            self.turn_start_time = Some(Instant::now());
        }

        let rate = self.cancellation_rate();
        self.silence.adjust_debounce(rate);
    }

    fn current_turn_record(&self, was_interrupted: bool) -> TurnRecord {
        let duration_ms = self
            .turn_start_time
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0);
        TurnRecord {
            turn_id: format!("{}_{}", self.session_id, self.total_turns),
            user_text: self.transcript.get_final_text(),
            agent_text: self.agent_sentences.join(" "),
            duration_ms,
            was_interrupted,
        }
    }

    fn reset_to_idle(&mut self, reason: &str) {
        if self.state.current() != TurnState::Idle {
            self.transition(TurnState::Idle, reason);
        }
        self.clear_turn_state();
        self.turn_start_time = None;
    }

    fn clear_turn_state(&mut self) {
        self.transcript.clear();
        self.audio_buffer.clear();
        self.silence.cancel();
        self.agent_sentences.clear();
        self.first_sentence_seen = false;
        self.llm_sent_final = false;
        self.chunk_index = 0;
        self.audio_chunks_sent = 0;
        self.waiting_for_playback = false;
        self.turn_complete_sent = false;
        self.disarm_playback();
        self.drop_sentence_queue();
        self.active_run = None;
        self.timings = TurnTimings::default();
    }

    fn arm_playback_deadline(&mut self) {
        self.disarm_playback();
        self.playback_generation += 1;
        let generation = self.playback_generation;
        let task_tx = self.task_tx.clone();
        let timeout = Duration::from_millis(self.config.playback_timeout_ms);
        self.playback_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = task_tx.send(TaskEvent::PlaybackDeadline { generation });
        }));
    }

    fn disarm_playback(&mut self) {
        self.playback_generation += 1;
        if let Some(task) = self.playback_task.take() {
            task.abort();
        }
    }

    fn apply_settings(&mut self, update: SettingsUpdate) {
        if let Some(debounce_ms) = update.silence_debounce_ms {
            self.silence.set_debounce_ms(debounce_ms);
            info!("silence debounce updated: {debounce_ms}ms");
        }
        if let Some(threshold) = update.cancellation_threshold {
            self.silence.set_threshold(threshold);
            info!("cancellation threshold updated: {threshold}");
        }
        if let Some(enabled) = update.adaptive_debounce_enabled {
            self.silence.set_adaptive_enabled(enabled);
            info!("adaptive debounce enabled: {enabled}");
        }
    }

    fn telemetry(&self) -> Telemetry {
        Telemetry {
            cancellation_rate: self.cancellation_rate(),
            current_debounce_ms: self.silence.current_debounce_ms(),
            total_turns: self.total_turns,
            interruption_count: self.interruption_count,
            tokens_wasted: self.tokens_wasted,
        }
    }

    fn cancellation_rate(&self) -> f32 {
        if self.total_turns == 0 {
            0.0
        } else {
            self.cancelled_turns as f32 / self.total_turns as f32
        }
    }

    /// Perform a transition and emit the state-change event, or report an
    /// internal error (scheduler bug) without changing state.
    fn transition(&mut self, to: TurnState, reason: &str) -> bool {
        match self.state.transition(to, reason) {
            Ok(from) => {
                let _ = self.events.send(TurnEvent::StateChange { from, to });
                true
            }
            Err(e) => {
                error!("{e}");
                self.emit_error(ErrorCode::InternalError, e.to_string(), true);
                false
            }
        }
    }

    fn emit_error(&self, code: ErrorCode, message: String, recoverable: bool) {
        let _ = self.events.send(TurnEvent::Error {
            code,
            message,
            recoverable,
        });
    }
}

/// Consume the LLM sentence stream under the turn's total-time budget.
async fn run_llm_producer(
    llm: Arc<dyn LanguageModel>,
    messages: Vec<ChatMessage>,
    cancel: CancellationToken,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
    run_id: u64,
    budget: Duration,
) {
    let deadline = tokio::time::Instant::now() + budget;

    let mut stream = tokio::select! {
        () = cancel.cancelled() => return,
        () = tokio::time::sleep_until(deadline) => {
            let _ = task_tx.send(TaskEvent::Llm { run_id, event: LlmTaskEvent::TimedOut });
            return;
        }
        result = llm.stream_sentences(messages, cancel.clone()) => match result {
            Ok(stream) => stream,
            Err(e) => {
                let _ = task_tx.send(TaskEvent::Llm {
                    run_id,
                    event: LlmTaskEvent::Failed(e.to_string()),
                });
                return;
            }
        },
    };

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(deadline) => {
                let _ = task_tx.send(TaskEvent::Llm { run_id, event: LlmTaskEvent::TimedOut });
                return;
            }
            item = stream.next() => item,
        };
        match item {
            Some(Ok(chunk)) => {
                let _ = task_tx.send(TaskEvent::Llm {
                    run_id,
                    event: LlmTaskEvent::Sentence(chunk),
                });
            }
            Some(Err(e)) => {
                let _ = task_tx.send(TaskEvent::Llm {
                    run_id,
                    event: LlmTaskEvent::Failed(e.to_string()),
                });
                return;
            }
            None => break,
        }
    }

    let _ = task_tx.send(TaskEvent::Llm {
        run_id,
        event: LlmTaskEvent::Done,
    });
}

/// Drain the sentence queue through the TTS adapter, forwarding audio chunks
/// in production order. Ends on the final sentence, the empty sentinel,
/// cancellation, or the queue safety timeout.
async fn run_tts_consumer(
    tts: Arc<dyn TextToSpeech>,
    mut sentences: mpsc::Receiver<SentenceChunk>,
    cancel: CancellationToken,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
    run_id: u64,
    queue_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = tokio::time::timeout(queue_timeout, sentences.recv()) => next,
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            // Queue dropped by the controller during a cancellation path.
            Ok(None) => return,
            Err(_) => {
                let _ = task_tx.send(TaskEvent::Tts {
                    run_id,
                    event: TtsTaskEvent::QueueTimedOut,
                });
                return;
            }
        };

        if chunk.text.is_empty() && chunk.is_final {
            let _ = task_tx.send(TaskEvent::Tts {
                run_id,
                event: TtsTaskEvent::StreamEnd,
            });
            return;
        }

        debug!("synthesizing sentence: \"{}\"", chunk.text);
        let mut audio = match tts.synthesize(&chunk.text, cancel.clone()).await {
            Ok(audio) => audio,
            Err(e) => {
                let _ = task_tx.send(TaskEvent::Tts {
                    run_id,
                    event: TtsTaskEvent::Failed(e.to_string()),
                });
                return;
            }
        };

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                item = audio.next() => item,
            };
            match item {
                Some(Ok(bytes)) => {
                    let _ = task_tx.send(TaskEvent::Tts {
                        run_id,
                        event: TtsTaskEvent::Audio(bytes),
                    });
                }
                Some(Err(e)) => {
                    let _ = task_tx.send(TaskEvent::Tts {
                        run_id,
                        event: TtsTaskEvent::Failed(e.to_string()),
                    });
                    return;
                }
                None => break,
            }
        }

        if chunk.is_final {
            let _ = task_tx.send(TaskEvent::Tts {
                run_id,
                event: TtsTaskEvent::StreamEnd,
            });
            return;
        }
    }
}

/// Rough completion-token estimate for discarded generations.
fn estimate_tokens(sentences: &[String]) -> u64 {
    sentences
        .iter()
        .map(|sentence| sentence.split_whitespace().count() as u64)
        .sum()
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn token_estimate_counts_words() {
        let sentences = vec!["Hi there.".to_owned(), "How can I help?".to_owned()];
        assert!(estimate_tokens(&sentences) == 6);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert!(truncate("hello", 100) == "hello");
        assert!(truncate("hello", 2) == "he");
        assert!(truncate("héllo", 2) == "hé");
    }
}
