use std::future::Future;
use std::pin::Pin;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::model::Capabilities;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Speaker role as the upstream service sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

const TEXTUAL_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-python",
    "application/x-sh",
    "application/x-yaml",
    "application/toml",
    "application/sql",
];

fn normalized_mime(mime_type: &str) -> String {
    mime_type.trim().to_ascii_lowercase()
}

/// Payloads of this type are UTF-8 text and can be inlined into a prompt.
pub fn is_textual_mime(mime_type: &str) -> bool {
    let mime = normalized_mime(mime_type);
    mime.starts_with("text/") || TEXTUAL_APPLICATION_TYPES.contains(&mime.as_str())
}

/// Attachments of this type are shared documents. Images and audio never are.
pub fn is_document_mime(mime_type: &str) -> bool {
    is_textual_mime(mime_type) || normalized_mime(mime_type) == "application/pdf"
}

/// Attachment bytes forwarded inline with a turn. `data` is base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAttachment {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

impl InlineAttachment {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn is_textual(&self) -> bool {
        is_textual_mime(&self.mime_type)
    }

    /// Renders the attachment as prompt text. Textual payloads are decoded; anything
    /// else is referenced by name so the model at least knows it exists.
    pub fn render_inline(&self) -> String {
        if self.is_textual()
            && let Ok(bytes) = BASE64.decode(self.data.as_bytes())
            && let Ok(text) = String::from_utf8(bytes)
        {
            return format!(
                "<document name=\"{}\" type=\"{}\">\n{}\n</document>",
                self.name, self.mime_type, text
            );
        }

        let approx_bytes = self.data.len() / 4 * 3;
        format!(
            "[attachment: {} ({}), ~{} bytes]",
            self.name, self.mime_type, approx_bytes
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<InlineAttachment>,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<InlineAttachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Message text with every attachment payload folded in ahead of the body.
    pub fn inlined_text(&self) -> String {
        if self.attachments.is_empty() {
            return self.content.clone();
        }

        let mut parts = Vec::with_capacity(self.attachments.len() + 1);
        parts.extend(self.attachments.iter().map(InlineAttachment::render_inline));
        parts.push(self.content.clone());
        parts.join("\n\n")
    }
}

/// Routing key for one in-flight turn. `session_id` names the thread, `turn_id` changes
/// on every submission so late events from an abandoned turn can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget {
    pub session_id: u64,
    pub turn_id: u64,
}

impl StreamTarget {
    pub const fn new(session_id: u64, turn_id: u64) -> Self {
        Self {
            session_id,
            turn_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub documents: Vec<InlineAttachment>,
    pub capabilities: Capabilities,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            messages,
            documents: Vec::new(),
            capabilities: Capabilities::default(),
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_documents(mut self, documents: Vec<InlineAttachment>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// The newest user turn, which providers send as the prompt.
    pub fn prompt(&self) -> Option<&ProviderMessage> {
        self.messages.last()
    }
}

/// Provider-agnostic stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    ThoughtDelta(String),
    MessageDelta(String),
    Complete { audio: Option<String> },
    Error(String),
}

impl StreamEventPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

/// Coarse classification of an upstream failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidCredential,
    ContentPolicy,
    Other,
}

pub fn classify_failure(message: &str) -> FailureKind {
    let lowered = message.to_ascii_lowercase();
    let credential_markers = [
        "401",
        "403",
        "api key",
        "api_key",
        "unauthorized",
        "invalid_api_key",
        "permission denied",
    ];
    let policy_markers = [
        "content policy",
        "content_policy",
        "content_filter",
        "safety",
        "blocked",
    ];

    if credential_markers
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        FailureKind::InvalidCredential
    } else if policy_markers.iter().any(|marker| lowered.contains(marker)) {
        FailureKind::ContentPolicy
    } else {
        FailureKind::Other
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("no API key configured for '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("unknown provider '{provider_id}'"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("nothing to send for {target:?}"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("cannot build http client during {stage}: {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completion request failed during {stage}: {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("upstream stream failed on `{stage}`: {message}"))]
    StreamFailed {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("upstream stream for {target:?} closed before a terminal event"))]
    StreamClosed {
        stage: &'static str,
        target: StreamTarget,
    },
}

impl ProviderError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::MissingApiKey { .. } => FailureKind::InvalidCredential,
            other => classify_failure(&other.to_string()),
        }
    }
}

pub struct ProviderEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Runs one request to completion and returns the answer text.
///
/// Thought deltas are dropped; callers that need them consume the stream directly.
pub async fn complete(
    provider: &dyn LlmProvider,
    request: StreamRequest,
) -> ProviderResult<String> {
    let handle = provider.stream_chat(request)?;
    collect_answer(handle).await
}

pub async fn collect_answer(handle: ProviderStreamHandle) -> ProviderResult<String> {
    let ProviderStreamHandle { mut stream, worker } = handle;
    let target = stream.target();
    let worker_task = tokio::spawn(worker);

    let mut answer = String::new();
    let outcome = loop {
        match stream.recv().await {
            Some(event) => match event.payload {
                StreamEventPayload::ThoughtDelta(_) => {}
                StreamEventPayload::MessageDelta(delta) => answer.push_str(&delta),
                StreamEventPayload::Complete { .. } => break Ok(answer),
                StreamEventPayload::Error(message) => {
                    break StreamFailedSnafu {
                        stage: "collect-answer",
                        message,
                    }
                    .fail();
                }
            },
            None => {
                break StreamClosedSnafu {
                    stage: "collect-answer",
                    target,
                }
                .fail();
            }
        }
    };

    drop(stream);
    if let Err(error) = worker_task.await {
        tracing::warn!(
            target = ?target,
            error = %error,
            "provider worker task did not finish cleanly"
        );
    }
    outcome
}

pub(crate) fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textual_attachment_is_decoded_inline() {
        let attachment =
            InlineAttachment::new("notes.txt", "text/plain", BASE64.encode("remember the milk"));
        let rendered = attachment.render_inline();

        assert!(rendered.starts_with("<document name=\"notes.txt\" type=\"text/plain\">"));
        assert!(rendered.contains("remember the milk"));
    }

    #[test]
    fn binary_attachment_is_only_referenced() {
        let attachment = InlineAttachment::new("photo.png", "image/png", BASE64.encode([0u8; 30]));
        let rendered = attachment.render_inline();

        assert!(rendered.starts_with("[attachment: photo.png (image/png)"));
    }

    #[test]
    fn pdfs_are_documents_but_not_inline_text() {
        assert!(is_document_mime("Application/PDF"));
        assert!(!is_textual_mime("application/pdf"));
        assert!(is_document_mime(" text/markdown "));
        assert!(is_textual_mime("application/json"));
        assert!(!is_document_mime("image/png"));
        assert!(!is_document_mime("audio/wav"));
    }

    #[test]
    fn inlined_text_places_documents_before_the_body() {
        let message = ProviderMessage::new(Role::User, "summarize this").with_attachments(vec![
            InlineAttachment::new("a.md", "text/markdown", BASE64.encode("# heading")),
        ]);

        let text = message.inlined_text();
        let body_at = text.find("summarize this").unwrap();
        let doc_at = text.find("# heading").unwrap();
        assert!(doc_at < body_at);
    }

    #[test]
    fn failure_messages_are_classified() {
        assert_eq!(
            classify_failure("HTTP 401: Incorrect API key provided"),
            FailureKind::InvalidCredential
        );
        assert_eq!(
            classify_failure("response blocked by content_filter"),
            FailureKind::ContentPolicy
        );
        assert_eq!(classify_failure("connection reset by peer"), FailureKind::Other);
    }
}
