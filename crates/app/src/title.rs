//! Background branch-label regeneration.

use std::sync::Arc;

use arbor_llm::{LlmProvider, ProviderMessage, Role, StreamRequest, StreamTarget, complete};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::TurnOptions;
use crate::ids::NodeId;

pub const FALLBACK_LABEL: &str = "New branch";
pub const MAX_TITLE_CHARS: usize = 40;

const TITLE_INSTRUCTION: &str = "Write a title of at most five words for this conversation. \
Reply with the title only, without quotes or punctuation at the end.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelSource {
    Generated,
    Fallback,
}

/// New label for a node. Carries nothing but the label and the node's label
/// generation at request time; updates from an older generation are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelUpdate {
    pub node_id: NodeId,
    pub generation: u64,
    pub label: String,
    pub source: LabelSource,
}

/// The exchange a title is generated from.
#[derive(Debug, Clone)]
pub struct TitleJob {
    pub node_id: NodeId,
    pub generation: u64,
    pub user_text: String,
    pub reply: String,
}

/// Local summary used when the provider cannot produce a title.
pub fn fallback_title(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return FALLBACK_LABEL.to_string();
    }
    truncate_title(&collapsed)
}

fn truncate_title(text: &str) -> String {
    if text.chars().count() <= MAX_TITLE_CHARS {
        return text.to_string();
    }

    let head: String = text.chars().take(MAX_TITLE_CHARS).collect();
    format!("{}…", head.trim_end())
}

/// First line of a model reply with wrapping quotes stripped.
fn clean_generated_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let title = line
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*'))
        .trim_end_matches(['.', ':'])
        .trim();
    (!title.is_empty()).then(|| truncate_title(title))
}

fn title_request(
    target: StreamTarget,
    options: &TurnOptions,
    user_text: &str,
    reply: &str,
) -> StreamRequest {
    let transcript = format!("User: {user_text}\n\nAssistant: {reply}");
    let mut request = StreamRequest::new(
        target,
        options.model_id.clone(),
        vec![ProviderMessage::new(Role::User, transcript)],
    )
    .with_preamble(TITLE_INSTRUCTION)
    .with_temperature(0.2);
    if let Some(max_tokens) = options.max_tokens {
        request = request.with_max_tokens(max_tokens.min(32));
    }
    request
}

/// Detached task that asks the provider for a label and sends the result on `updates`.
///
/// Never touches the tree. Any failure is logged and replaced by [`fallback_title`].
pub fn spawn_title_task(
    provider: Arc<dyn LlmProvider>,
    options: TurnOptions,
    target: StreamTarget,
    job: TitleJob,
    updates: mpsc::UnboundedSender<LabelUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let TitleJob {
            node_id,
            generation,
            user_text,
            reply,
        } = job;
        let request = title_request(target, &options, &user_text, &reply);
        let generated = match complete(provider.as_ref(), request).await {
            Ok(raw) => clean_generated_title(&raw),
            Err(error) => {
                tracing::warn!(node_id = %node_id, error = %error, "title generation failed");
                None
            }
        };

        let (label, source) = match generated {
            Some(label) => (label, LabelSource::Generated),
            None => (fallback_title(&user_text), LabelSource::Fallback),
        };
        let update = LabelUpdate {
            node_id,
            generation,
            label,
            source,
        };

        if updates.send(update).is_err() {
            tracing::debug!("label update dropped; workspace is gone");
        }
    })
}

#[cfg(test)]
mod tests {
    use arbor_llm::{ScriptedProvider, ScriptedReply};

    use super::*;

    #[test]
    fn fallback_collapses_whitespace_and_truncates() {
        assert_eq!(fallback_title("  what   is\n rust  "), "what is rust");
        assert_eq!(fallback_title("   "), FALLBACK_LABEL);

        let long = "a".repeat(39) + " bcdef";
        let title = fallback_title(&long);
        assert!(title.ends_with('…'));
        assert_eq!(title, format!("{}…", "a".repeat(39)));
    }

    #[test]
    fn fallback_truncates_on_char_boundaries() {
        let text = "é".repeat(50);
        let title = fallback_title(&text);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS + 1);
    }

    #[test]
    fn generated_titles_are_cleaned() {
        assert_eq!(
            clean_generated_title("\n\"Rust lifetimes.\"\nextra"),
            Some("Rust lifetimes".to_string())
        );
        assert_eq!(clean_generated_title("  \n "), None);
    }

    async fn run(provider: ScriptedProvider) -> LabelUpdate {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_title_task(
            Arc::new(provider),
            TurnOptions::default(),
            StreamTarget::new(0, 1),
            TitleJob {
                node_id: NodeId::new("n"),
                generation: 3,
                user_text: "how do lifetimes work".to_string(),
                reply: "they scope borrows".to_string(),
            },
            tx,
        )
        .await
        .unwrap();
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn successful_generation_sends_the_model_title() {
        let update = run(ScriptedProvider::with_replies([ScriptedReply::answer(
            "Lifetimes explained",
        )]))
        .await;

        assert_eq!(update.node_id, NodeId::new("n"));
        assert_eq!(update.generation, 3);
        assert_eq!(update.label, "Lifetimes explained");
        assert_eq!(update.source, LabelSource::Generated);
    }

    #[tokio::test]
    async fn failed_generation_falls_back_to_the_user_text() {
        let update = run(ScriptedProvider::with_replies([
            ScriptedReply::new().fail("quota exceeded")
        ]))
        .await;

        assert_eq!(update.label, "how do lifetimes work");
        assert_eq!(update.source, LabelSource::Fallback);
    }
}
