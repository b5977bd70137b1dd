//! In-process provider that replays scripted replies.
//!
//! Used by tests across the workspace and by the CLI's offline mode. Each call to
//! `stream_chat` consumes the next queued reply; once the queue is empty the provider
//! echoes the prompt back as a plain answer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    EmptyMessageSetSnafu, LlmProvider, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamEvent, StreamEventPayload, StreamRequest, StreamTarget, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

/// One scripted reply: a sequence of payloads, optionally left open afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptedReply {
    events: Vec<StreamEventPayload>,
    hang: bool,
}

impl ScriptedReply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain answer followed by completion.
    pub fn answer(text: impl Into<String>) -> Self {
        Self::new().message(text).complete()
    }

    pub fn thought(mut self, text: impl Into<String>) -> Self {
        self.events
            .push(StreamEventPayload::ThoughtDelta(text.into()));
        self
    }

    pub fn message(mut self, text: impl Into<String>) -> Self {
        self.events
            .push(StreamEventPayload::MessageDelta(text.into()));
        self
    }

    pub fn complete(mut self) -> Self {
        self.events.push(StreamEventPayload::Complete { audio: None });
        self
    }

    pub fn complete_with_audio(mut self, audio: impl Into<String>) -> Self {
        self.events.push(StreamEventPayload::Complete {
            audio: Some(audio.into()),
        });
        self
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.events.push(StreamEventPayload::Error(message.into()));
        self
    }

    /// Keep the stream open after the scripted events until the consumer cancels.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn events(&self) -> &[StreamEventPayload] {
        &self.events
    }
}

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<ScriptedReply>,
    requests: Vec<StreamRequest>,
}

#[derive(Clone, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ScriptState>>,
    step_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        let provider = Self::new();
        for reply in replies {
            provider.push_reply(reply);
        }
        provider
    }

    /// Pause between events, which gives cancellation tests a window to fire.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        if let Ok(mut state) = self.state.lock() {
            state.replies.push_back(reply);
        }
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.state
            .lock()
            .map(|state| state.requests.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self, request: &StreamRequest) -> ScriptedReply {
        let Ok(mut state) = self.state.lock() else {
            return ScriptedReply::new().fail("scripted provider state is poisoned");
        };
        state.requests.push(request.clone());
        state.replies.pop_front().unwrap_or_else(|| {
            let prompt = request
                .prompt()
                .map(|message| message.content.clone())
                .unwrap_or_default();
            ScriptedReply::answer(format!("echo: {prompt}"))
        })
    }

    async fn run_script(
        target: StreamTarget,
        reply: ScriptedReply,
        step_delay: Option<Duration>,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for payload in reply.events {
            if let Some(delay) = step_delay {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        tracing::debug!(target = ?target, "scripted stream cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if event_tx.send(StreamEvent { target, payload }).is_err() {
                return;
            }
        }

        if reply.hang {
            let _ = cancel_rx.await;
            tracing::debug!(target = ?target, "scripted stream released after hang");
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "scripted-stream-chat",
                target: request.target,
            }
        );

        let reply = self.next_reply(&request);
        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_script(
            request.target,
            reply,
            self.step_delay,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderMessage, Role, complete};

    fn request(prompt: &str) -> StreamRequest {
        StreamRequest::new(
            StreamTarget::new(7, 1),
            "scripted-model",
            vec![ProviderMessage::new(Role::User, prompt)],
        )
    }

    #[tokio::test]
    async fn replays_queued_replies_in_order() {
        let provider = ScriptedProvider::with_replies([
            ScriptedReply::new().thought("hmm").message("first").complete(),
            ScriptedReply::answer("second"),
        ]);

        assert_eq!(complete(&provider, request("a")).await.unwrap(), "first");
        assert_eq!(complete(&provider, request("b")).await.unwrap(), "second");
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn echoes_when_the_queue_is_empty() {
        let provider = ScriptedProvider::new();
        let answer = complete(&provider, request("ping")).await.unwrap();
        assert_eq!(answer, "echo: ping");
    }

    #[tokio::test]
    async fn scripted_errors_surface_from_complete() {
        let provider = ScriptedProvider::with_replies([ScriptedReply::new()
            .message("partial")
            .fail("quota exceeded")]);

        let error = complete(&provider, request("x")).await.unwrap_err();
        assert!(error.to_string().contains("quota exceeded"));
    }
}
