use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::model::DEFAULT_OPENAI_MODEL;
use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEvent, StreamEventPayload, StreamRequest,
    StreamTarget, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn client_for(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let builder = openai::Client::builder().api_key(config.api_key.as_str());
        let builder = match config.endpoint.as_str() {
            "" => builder,
            endpoint => builder.base_url(endpoint),
        };
        builder.build().context(HttpClientSnafu {
            stage: "rig-client",
        })
    }

    fn rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.inlined_text()),
            Role::Model => RigMessage::assistant(message.content.clone()),
        }
    }

    /// Operator preamble followed by the thread's document set, so documents
    /// stay visible on every later turn of the branch.
    fn system_preamble(request: &StreamRequest) -> Option<String> {
        let operator = request
            .preamble
            .as_deref()
            .map(str::trim)
            .filter(|preamble| !preamble.is_empty())
            .map(str::to_string);

        let documents = (!request.documents.is_empty()).then(|| {
            let rendered = request
                .documents
                .iter()
                .map(|document| document.render_inline())
                .collect::<Vec<_>>()
                .join("\n\n");
            format!("The following documents are shared with this conversation:\n\n{rendered}")
        });

        match (operator, documents) {
            (Some(operator), Some(documents)) => Some(format!("{operator}\n\n{documents}")),
            (operator, documents) => operator.or(documents),
        }
    }

    async fn start_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let model = Self::client_for(config)?.completion_model(request.model_id.clone());

        let mut history: Vec<RigMessage> = request.messages.iter().map(Self::rig_message).collect();
        let Some(prompt) = history.pop() else {
            return EmptyMessageSetSnafu {
                stage: "rig-start-prompt",
                target: request.target,
            }
            .fail();
        };

        let mut completion = model.completion_request(prompt).messages(history);
        if let Some(preamble) = Self::system_preamble(request) {
            completion = completion.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            completion = completion.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            completion = completion.max_tokens(max_tokens);
        }
        if request.capabilities.thinking {
            completion = completion.additional_params(serde_json::json!({
                "reasoning": { "summary": "auto" }
            }));
        }
        if request.capabilities.audio {
            tracing::debug!(
                target = ?request.target,
                model_id = %request.model_id,
                "audio requested; responses stream yields text only"
            );
        }

        completion.stream().await.context(CompletionsFailedSnafu {
            stage: "rig-start-stream",
        })
    }

    fn chunk_payload<R>(chunk: StreamedAssistantContent<R>) -> Option<StreamEventPayload>
    where
        R: Clone + Unpin,
    {
        match chunk {
            StreamedAssistantContent::Text(text) => {
                Some(StreamEventPayload::MessageDelta(text.text))
            }
            StreamedAssistantContent::Reasoning(reasoning) => {
                let text = reasoning.reasoning.concat();
                (!text.is_empty()).then_some(StreamEventPayload::ThoughtDelta(text))
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                (!reasoning.is_empty()).then_some(StreamEventPayload::ThoughtDelta(reasoning))
            }
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn pump(
        stream: &mut RigStreamingResponse,
        target: StreamTarget,
        events: &mpsc::UnboundedSender<StreamEvent>,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> PumpEnd {
        loop {
            let chunk = tokio::select! {
                _ = &mut *cancel_rx => {
                    stream.cancel();
                    return PumpEnd::Cancelled;
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                None => return PumpEnd::Exhausted,
                Some(Err(source)) => {
                    return PumpEnd::Failed(ProviderError::CompletionsFailed {
                        stage: "rig-stream-chunk",
                        source,
                    });
                }
                Some(Ok(chunk)) => {
                    let Some(payload) = Self::chunk_payload(chunk) else {
                        continue;
                    };
                    if events.send(StreamEvent { target, payload }).is_err() {
                        return PumpEnd::Detached;
                    }
                }
            }
        }
    }

    async fn run_worker(
        config: ProviderConfig,
        request: StreamRequest,
        events: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;
        let outcome = match Self::start_stream(&config, &request).await {
            Ok(mut stream) => Self::pump(&mut stream, target, &events, &mut cancel_rx).await,
            Err(error) => PumpEnd::Failed(error),
        };

        let payload = match outcome {
            PumpEnd::Exhausted => StreamEventPayload::Complete { audio: None },
            PumpEnd::Failed(error) => {
                tracing::warn!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "rig stream failed"
                );
                StreamEventPayload::Error(error.to_string())
            }
            PumpEnd::Cancelled => {
                tracing::debug!(target = ?target, "rig stream cancelled");
                return;
            }
            PumpEnd::Detached => return,
        };
        let _ = events.send(StreamEvent { target, payload });
    }
}

enum PumpEnd {
    Exhausted,
    Cancelled,
    Detached,
    Failed(ProviderError),
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn default_model(&self) -> &str {
        DEFAULT_OPENAI_MODEL
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "rig-stream-chat",
                target: request.target,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
