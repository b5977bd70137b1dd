//! Flattens a node's root path into the payload of a new turn.

use std::collections::HashSet;

use arbor_llm::{
    Capabilities, DEFAULT_OPENAI_MODEL, ProviderMessage, StreamRequest, StreamTarget,
    capabilities_for,
};

use crate::document::DocumentKey;
use crate::ids::NodeId;
use crate::message::{Attachment, Message};
use crate::tree::{TreeResult, TreeStore};

/// Per-turn request knobs resolved from settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOptions {
    pub model_id: String,
    pub capabilities: Capabilities,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_OPENAI_MODEL.to_string(),
            capabilities: capabilities_for(DEFAULT_OPENAI_MODEL),
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Every message on the path from the root to `node_id`, root first. Ancestors
/// contribute what they held when the path branched off them.
pub fn history_for(tree: &TreeStore, node_id: &NodeId) -> TreeResult<Vec<Message>> {
    let mut history = tree.history_at_branch(node_id)?;
    history.extend_from_slice(tree.history(node_id)?);
    Ok(history)
}

/// Error turns and unfilled placeholders never go upstream.
pub fn is_replayable(message: &Message) -> bool {
    !message.is_error && !message.is_empty_placeholder()
}

pub fn to_provider_history(messages: &[Message]) -> Vec<ProviderMessage> {
    messages
        .iter()
        .filter(|message| is_replayable(message))
        .map(Message::to_provider_message)
        .collect()
}

pub fn assemble(tree: &TreeStore, node_id: &NodeId) -> TreeResult<Vec<ProviderMessage>> {
    Ok(to_provider_history(&history_for(tree, node_id)?))
}

/// Builds the request for a new turn. Documents already inlined somewhere in the
/// conversation are not repeated in the document block.
pub fn build_request<'a>(
    target: StreamTarget,
    options: &TurnOptions,
    mut history: Vec<ProviderMessage>,
    prompt: ProviderMessage,
    documents: impl IntoIterator<Item = &'a Attachment>,
) -> StreamRequest {
    history.push(prompt);

    let inlined: HashSet<DocumentKey> = history
        .iter()
        .flat_map(|message| &message.attachments)
        .map(|attachment| DocumentKey {
            name: attachment.name.clone(),
            mime_type: attachment.mime_type.clone(),
        })
        .collect();
    let documents = documents
        .into_iter()
        .filter(|document| !inlined.contains(&DocumentKey::of(document)))
        .map(Attachment::to_inline)
        .collect();

    let mut request = StreamRequest::new(target, options.model_id.clone(), history)
        .with_documents(documents)
        .with_capabilities(options.capabilities);
    if let Some(preamble) = options
        .preamble
        .as_deref()
        .filter(|text| !text.trim().is_empty())
    {
        request = request.with_preamble(preamble);
    }
    if let Some(temperature) = options.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(max_tokens) = options.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    request
}
