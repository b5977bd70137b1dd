use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;
mod scripted;
pub mod wire;

pub use model::{
    Capabilities, DEFAULT_OPENAI_MODEL, Model, capabilities_for, default_openai_models,
};
pub use provider::{
    BoxFuture, FailureKind, InlineAttachment, LlmProvider, ProviderConfig, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker,
    Role, StreamEvent, StreamEventPayload, StreamRequest, StreamTarget, classify_failure,
    collect_answer, complete, is_document_mime, is_textual_mime,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptedProvider, ScriptedReply};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        SCRIPTED_PROVIDER_ID => Ok(Arc::new(ScriptedProvider::new())),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
