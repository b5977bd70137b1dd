//! Rebuilds one model message from an incremental provider stream.

use std::time::{Duration, Instant};

use arbor_llm::{StreamEvent, StreamEventPayload, StreamTarget};
use snafu::{Snafu, ensure};

use crate::message::{Attachment, Message, compose};

/// Phase of one in-flight turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AssemblyPhase {
    #[default]
    Idle,
    Thinking,
    Answering,
    Complete,
    Errored {
        message: String,
    },
}

impl AssemblyPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Errored { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Answering => "answering",
            Self::Complete => "complete",
            Self::Errored { .. } => "errored",
        }
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum AssemblyError {
    #[snafu(display("stream event arrived before the turn started"))]
    NotStarted { stage: &'static str },
    #[snafu(display("turn already started"))]
    AlreadyStarted { stage: &'static str },
    #[snafu(display("stream event arrived after the turn ended in `{phase}`"))]
    Terminal {
        stage: &'static str,
        phase: &'static str,
    },
    #[snafu(display("stream event for {attempted:?} does not belong to active turn {active:?}"))]
    SessionMismatch {
        stage: &'static str,
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type AssemblyResult<T> = Result<T, AssemblyError>;

#[derive(Debug, Clone)]
pub struct StreamAssembler {
    target: StreamTarget,
    model_id: Option<String>,
    phase: AssemblyPhase,
    thoughts: String,
    answer: String,
    audio: Option<String>,
    started_at: Option<Instant>,
    thinking_duration: Option<Duration>,
}

impl StreamAssembler {
    pub fn new(target: StreamTarget, model_id: Option<String>) -> Self {
        Self {
            target,
            model_id,
            phase: AssemblyPhase::Idle,
            thoughts: String::new(),
            answer: String::new(),
            audio: None,
            started_at: None,
            thinking_duration: None,
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub fn phase(&self) -> &AssemblyPhase {
        &self.phase
    }

    /// Time between start and the first answer delta, once known.
    pub fn thinking_duration(&self) -> Option<Duration> {
        self.thinking_duration
    }

    /// Enters `Thinking` and returns the empty placeholder to store.
    pub fn start(&mut self) -> AssemblyResult<Message> {
        ensure!(
            self.phase == AssemblyPhase::Idle,
            AlreadyStartedSnafu {
                stage: "assembler-start",
            }
        );

        self.phase = AssemblyPhase::Thinking;
        self.started_at = Some(Instant::now());
        Ok(Message::placeholder(self.model_id.clone()))
    }

    /// Applies a routed event, rejecting events from any other turn.
    pub fn apply(&mut self, event: &StreamEvent) -> AssemblyResult<Message> {
        ensure!(
            event.target == self.target,
            SessionMismatchSnafu {
                stage: "assembler-apply-target",
                active: self.target,
                attempted: event.target,
            }
        );
        self.apply_payload(&event.payload)
    }

    /// Applies one payload and returns the message as it should now be stored.
    pub fn apply_payload(&mut self, payload: &StreamEventPayload) -> AssemblyResult<Message> {
        match &self.phase {
            AssemblyPhase::Idle => {
                return NotStartedSnafu {
                    stage: "assembler-apply",
                }
                .fail();
            }
            phase @ (AssemblyPhase::Complete | AssemblyPhase::Errored { .. }) => {
                return TerminalSnafu {
                    stage: "assembler-apply",
                    phase: phase.name(),
                }
                .fail();
            }
            AssemblyPhase::Thinking | AssemblyPhase::Answering => {}
        }

        match payload {
            StreamEventPayload::ThoughtDelta(text) => {
                self.thoughts.push_str(text);
            }
            StreamEventPayload::MessageDelta(text) => {
                if self.phase == AssemblyPhase::Thinking {
                    self.enter_answering();
                }
                self.answer.push_str(text);
            }
            StreamEventPayload::Complete { audio } => {
                self.audio = audio.clone().filter(|audio| !audio.is_empty());
                self.phase = AssemblyPhase::Complete;
            }
            StreamEventPayload::Error(message) => {
                tracing::warn!(
                    target = ?self.target,
                    error = %message,
                    "stream ended with an error"
                );
                self.phase = AssemblyPhase::Errored {
                    message: message.clone(),
                };
            }
        }

        Ok(self.message())
    }

    fn enter_answering(&mut self) {
        self.phase = AssemblyPhase::Answering;
        self.thinking_duration = self.started_at.map(|started| started.elapsed());
        if let Some(duration) = self.thinking_duration {
            tracing::debug!(
                target = ?self.target,
                thinking_ms = duration.as_millis() as u64,
                "first answer delta"
            );
        }
    }

    /// Rendered single-string form of the current content.
    pub fn rendered(&self) -> String {
        compose(&self.thoughts, &self.answer)
    }

    /// Current content as a model message. Partial content survives errors.
    pub fn message(&self) -> Message {
        let mut message = Message::model(self.answer.clone(), self.model_id.clone());
        if !self.thoughts.is_empty() {
            message.thoughts = Some(self.thoughts.clone());
        }
        if let Some(audio) = &self.audio {
            message.attachments.push(Attachment::audio(audio.clone()));
        }
        message
    }
}
