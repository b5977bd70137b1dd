//! Per-node conversation sessions and the documents they share down the tree.

use std::collections::HashMap;
use std::sync::Arc;

use arbor_llm::{
    FailureKind, LlmProvider, ProviderError, ProviderMessage, ProviderStreamHandle, StreamTarget,
    classify_failure, collect_answer,
};
use snafu::{OptionExt, Snafu};
use tokio_util::sync::CancellationToken;

use crate::context::{self, TurnOptions};
use crate::document::DocumentSet;
use crate::ids::NodeId;
use crate::message::{Attachment, Message};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ThreadError {
    #[snafu(display("no thread exists for node '{node_id}'"))]
    ThreadNotFound {
        stage: &'static str,
        node_id: NodeId,
    },
    #[snafu(display("invalid credential on `{stage}`: {message}"))]
    InvalidCredential {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("content policy violation on `{stage}`: {message}"))]
    ContentPolicyViolation {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("upstream failure on `{stage}`: {message}"))]
    UpstreamFailure {
        stage: &'static str,
        message: String,
    },
}

pub type ThreadResult<T> = Result<T, ThreadError>;

impl ThreadError {
    /// Sorts a raw upstream failure message into the user-facing taxonomy.
    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_kind(stage, classify_failure(&message), message)
    }

    pub fn from_provider(stage: &'static str, error: &ProviderError) -> Self {
        Self::from_kind(stage, error.failure_kind(), error.to_string())
    }

    fn from_kind(stage: &'static str, kind: FailureKind, message: String) -> Self {
        match kind {
            FailureKind::InvalidCredential => Self::InvalidCredential { stage, message },
            FailureKind::ContentPolicy => Self::ContentPolicyViolation { stage, message },
            FailureKind::Other => Self::UpstreamFailure { stage, message },
        }
    }

    /// Text recorded as the model-role error message for a failed turn.
    pub fn user_message(&self) -> String {
        match self {
            Self::ThreadNotFound { node_id, .. } => {
                format!("This branch has no conversation session ({node_id}).")
            }
            Self::InvalidCredential { .. } => {
                "The provider rejected the API key. Check the key in your settings.".to_string()
            }
            Self::ContentPolicyViolation { .. } => {
                "The provider declined to answer because of its content policy.".to_string()
            }
            Self::UpstreamFailure { message, .. } => format!("The provider failed: {message}"),
        }
    }
}

/// Isolated conversation session bound to one node.
#[derive(Debug)]
pub struct Thread {
    node_id: NodeId,
    session_id: u64,
    parent_thread_id: Option<NodeId>,
    document_context: DocumentSet,
    inherited_documents: DocumentSet,
    history: Vec<ProviderMessage>,
    turns: u64,
    cancel: CancellationToken,
}

impl Thread {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn parent_thread_id(&self) -> Option<&NodeId> {
        self.parent_thread_id.as_ref()
    }

    pub fn document_context(&self) -> &DocumentSet {
        &self.document_context
    }

    pub fn inherited_documents(&self) -> &DocumentSet {
        &self.inherited_documents
    }

    /// Upstream turns this session has seen, oldest first.
    pub fn history(&self) -> &[ProviderMessage] {
        &self.history
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Own documents first, then inherited ones not shadowed by an own entry.
    pub fn effective_documents(&self) -> DocumentSet {
        let mut documents = self.document_context.clone();
        documents.merge(&self.inherited_documents);
        documents
    }
}

/// A turn that has been sent upstream but not yet consumed.
pub struct OpenTurn {
    pub target: StreamTarget,
    pub handle: ProviderStreamHandle,
    /// The user turn as sent, for [`ThreadContextManager::commit_turn`].
    pub prompt: ProviderMessage,
    /// Attachments of the user turn. They join the thread's documents only once
    /// the turn is committed.
    pub attachments: Vec<Attachment>,
    /// Fires when the owning thread is disposed.
    pub session_cancel: CancellationToken,
}

/// Starting state for a thread created from the tree rather than from a parent
/// thread.
#[derive(Debug, Default)]
pub struct ThreadSeed<'a> {
    /// The node's own messages. The thread's own documents come from here.
    pub own_history: &'a [Message],
    /// Conversation replayed into the new session.
    pub replay: Vec<ProviderMessage>,
    /// Documents the node saw at branch time.
    pub inherited: DocumentSet,
}

pub struct ThreadContextManager {
    provider: Arc<dyn LlmProvider>,
    options: TurnOptions,
    threads: HashMap<NodeId, Thread>,
    next_session_id: u64,
}

impl ThreadContextManager {
    pub fn new(provider: Arc<dyn LlmProvider>, options: TurnOptions) -> Self {
        Self {
            provider,
            options,
            threads: HashMap::new(),
            next_session_id: 0,
        }
    }

    pub fn provider(&self) -> Arc<dyn LlmProvider> {
        Arc::clone(&self.provider)
    }

    pub fn options(&self) -> &TurnOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: TurnOptions) {
        self.options = options;
    }

    pub fn thread(&self, node_id: &NodeId) -> Option<&Thread> {
        self.threads.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Returns the node's thread, creating it on first use.
    ///
    /// A new thread takes its documents from `history` and snapshots the parent
    /// thread's effective documents, if the parent has a thread. Later changes to the
    /// parent are not seen.
    pub fn resolve_thread(
        &mut self,
        node_id: &NodeId,
        history: &[Message],
        parent_id: Option<&NodeId>,
    ) -> &Thread {
        let thread = match self.threads.remove(node_id) {
            Some(existing) => existing,
            None => {
                let inherited = parent_id
                    .and_then(|id| self.threads.get(id))
                    .map(Thread::effective_documents)
                    .unwrap_or_default();
                let seed = ThreadSeed {
                    own_history: history,
                    replay: context::to_provider_history(history),
                    inherited,
                };
                self.create_thread(node_id, parent_id, seed)
            }
        };
        self.threads.entry(node_id.clone()).or_insert(thread)
    }

    /// Like [`Self::resolve_thread`], but a new thread inherits exactly
    /// `seed.inherited` instead of whatever the parent thread holds now.
    pub fn resolve_seeded(
        &mut self,
        node_id: &NodeId,
        parent_id: Option<&NodeId>,
        seed: ThreadSeed<'_>,
    ) -> &Thread {
        let thread = match self.threads.remove(node_id) {
            Some(existing) => existing,
            None => self.create_thread(node_id, parent_id, seed),
        };
        self.threads.entry(node_id.clone()).or_insert(thread)
    }

    fn create_thread(
        &mut self,
        node_id: &NodeId,
        parent_id: Option<&NodeId>,
        seed: ThreadSeed<'_>,
    ) -> Thread {
        let parent_thread_id = parent_id
            .filter(|id| self.threads.contains_key(*id))
            .cloned();

        self.next_session_id += 1;
        let thread = Thread {
            node_id: node_id.clone(),
            session_id: self.next_session_id,
            parent_thread_id,
            document_context: DocumentSet::from_history(seed.own_history),
            inherited_documents: seed.inherited,
            history: seed.replay,
            turns: 0,
            cancel: CancellationToken::new(),
        };

        tracing::info!(
            node_id = %node_id,
            session_id = thread.session_id,
            parent_thread_id = ?thread.parent_thread_id,
            documents = thread.document_context.len(),
            inherited = thread.inherited_documents.len(),
            "created thread"
        );
        thread
    }

    /// Merges documents found in `history` into the node's thread. Never removes any.
    pub fn refresh_documents(&mut self, node_id: &NodeId, history: &[Message]) -> usize {
        let Some(thread) = self.threads.get_mut(node_id) else {
            tracing::debug!(node_id = %node_id, "refresh skipped for node without thread");
            return 0;
        };

        let added = thread
            .document_context
            .merge(&DocumentSet::from_history(history));
        if added > 0 {
            tracing::debug!(node_id = %node_id, added, "refreshed thread documents");
        }
        added
    }

    pub fn branch_thread(
        &mut self,
        source_id: &NodeId,
        new_id: &NodeId,
        history: &[Message],
    ) -> &Thread {
        self.resolve_thread(new_id, history, Some(source_id))
    }

    pub fn effective_documents(&self, node_id: &NodeId) -> ThreadResult<DocumentSet> {
        self.threads
            .get(node_id)
            .map(Thread::effective_documents)
            .context(ThreadNotFoundSnafu {
                stage: "thread-effective-documents",
                node_id: node_id.clone(),
            })
    }

    /// Sends a user turn upstream and hands back the live stream. Nothing is added to
    /// the session history until [`Self::commit_turn`].
    pub fn open_turn(
        &mut self,
        node_id: &NodeId,
        text: &str,
        attachments: &[Attachment],
    ) -> ThreadResult<OpenTurn> {
        let thread = self.threads.get_mut(node_id).context(ThreadNotFoundSnafu {
            stage: "thread-open-turn",
            node_id: node_id.clone(),
        })?;

        thread.turns += 1;
        let target = StreamTarget::new(thread.session_id, thread.turns);
        let prompt = Message::user(text, attachments.to_vec()).to_provider_message();
        let documents = thread.effective_documents();
        let request = context::build_request(
            target,
            &self.options,
            thread.history.clone(),
            prompt.clone(),
            documents.iter(),
        );

        tracing::debug!(
            node_id = %node_id,
            target = ?target,
            messages = request.messages.len(),
            documents = request.documents.len(),
            attachments = attachments.len(),
            "opening turn"
        );

        let handle = self
            .provider
            .stream_chat(request)
            .map_err(|error| ThreadError::from_provider("thread-open-turn-stream", &error))?;

        Ok(OpenTurn {
            target,
            handle,
            prompt,
            attachments: attachments.to_vec(),
            session_cancel: thread.cancel.child_token(),
        })
    }

    /// Records a finished exchange in the session history and adopts the turn's
    /// document attachments. A turn that is never committed leaves no trace.
    pub fn commit_turn(
        &mut self,
        node_id: &NodeId,
        prompt: ProviderMessage,
        attachments: &[Attachment],
        answer: &str,
    ) -> ThreadResult<()> {
        let thread = self.threads.get_mut(node_id).context(ThreadNotFoundSnafu {
            stage: "thread-commit-turn",
            node_id: node_id.clone(),
        })?;
        let added = thread.document_context.extend_from(attachments);
        thread.history.push(prompt);
        thread
            .history
            .push(ProviderMessage::new(arbor_llm::Role::Model, answer));
        tracing::debug!(node_id = %node_id, new_documents = added, "committed turn");
        Ok(())
    }

    /// One full non-interactive turn: send, wait for the answer, commit.
    pub async fn send_turn(
        &mut self,
        node_id: &NodeId,
        text: &str,
        attachments: &[Attachment],
    ) -> ThreadResult<String> {
        let turn = self.open_turn(node_id, text, attachments)?;
        let answer = collect_answer(turn.handle)
            .await
            .map_err(|error| ThreadError::from_provider("thread-send-turn", &error))?;
        self.commit_turn(node_id, turn.prompt, &turn.attachments, &answer)?;
        Ok(answer)
    }

    pub fn dispose(&mut self, node_id: &NodeId) -> bool {
        match self.threads.remove(node_id) {
            Some(thread) => {
                thread.cancel.cancel();
                tracing::debug!(
                    node_id = %node_id,
                    session_id = thread.session_id,
                    "disposed thread"
                );
                true
            }
            None => false,
        }
    }

    pub fn dispose_all(&mut self) {
        for (_, thread) in self.threads.drain() {
            thread.cancel.cancel();
        }
        tracing::debug!("disposed all threads");
    }
}

#[cfg(test)]
mod tests {
    use arbor_llm::{ScriptedProvider, ScriptedReply};

    use super::*;
    use crate::document::DocumentKey;

    fn doc(name: &str) -> Attachment {
        Attachment::new(name, "text/plain", "ZG9j")
    }

    fn manager(provider: ScriptedProvider) -> ThreadContextManager {
        ThreadContextManager::new(Arc::new(provider), TurnOptions::default())
    }

    fn key(name: &str) -> DocumentKey {
        DocumentKey {
            name: name.to_string(),
            mime_type: "text/plain".to_string(),
        }
    }

    #[test]
    fn resolving_twice_returns_the_same_session() {
        let mut threads = manager(ScriptedProvider::new());
        let node = NodeId::new("a");

        let first = threads.resolve_thread(&node, &[], None).session_id();
        let second = threads.resolve_thread(&node, &[], None).session_id();

        assert_eq!(first, second);
        assert_eq!(threads.len(), 1);
    }

    #[test]
    fn branching_snapshots_the_parent_documents() {
        let mut threads = manager(ScriptedProvider::new());
        let parent = NodeId::new("a");
        let child = NodeId::new("b");

        let history = vec![Message::user("docs", vec![doc("d1"), doc("d2")])];
        threads.resolve_thread(&parent, &history, None);
        let branched = threads.branch_thread(&parent, &child, &[]);
        assert_eq!(branched.parent_thread_id(), Some(&parent));

        let later = vec![Message::user("more", vec![doc("d3")])];
        threads.refresh_documents(&parent, &later);

        let effective = threads.effective_documents(&child).unwrap();
        assert!(effective.contains(&key("d1")));
        assert!(effective.contains(&key("d2")));
        assert!(!effective.contains(&key("d3")));
        assert!(threads.effective_documents(&parent).unwrap().contains(&key("d3")));
    }

    #[test]
    fn branching_from_a_node_without_thread_inherits_nothing() {
        let mut threads = manager(ScriptedProvider::new());
        let thread = threads.branch_thread(&NodeId::new("none"), &NodeId::new("b"), &[]);
        assert!(thread.inherited_documents().is_empty());
        assert_eq!(thread.parent_thread_id(), None);
    }

    #[test]
    fn refresh_is_append_only() {
        let mut threads = manager(ScriptedProvider::new());
        let node = NodeId::new("a");
        threads.resolve_thread(&node, &[Message::user("x", vec![doc("d1")])], None);

        assert_eq!(threads.refresh_documents(&node, &[]), 0);
        assert_eq!(
            threads.refresh_documents(&node, &[Message::user("y", vec![doc("d2"), doc("d1")])]),
            1
        );
        assert_eq!(threads.thread(&node).unwrap().document_context().len(), 2);
    }

    #[test]
    fn duplicate_documents_on_one_node_collapse() {
        let mut threads = manager(ScriptedProvider::new());
        let node = NodeId::new("a");
        let history = vec![
            Message::user("one", vec![doc("notes.txt")]),
            Message::user("two", vec![Attachment::new("notes.txt", "text/plain", "b3RoZXI=")]),
        ];

        let thread = threads.resolve_thread(&node, &history, None);
        assert_eq!(thread.document_context().len(), 1);
    }

    #[tokio::test]
    async fn send_turn_requires_a_thread() {
        let mut threads = manager(ScriptedProvider::new());
        let error = threads
            .send_turn(&NodeId::new("ghost"), "hi", &[])
            .await
            .unwrap_err();
        assert!(matches!(error, ThreadError::ThreadNotFound { .. }));
    }

    #[tokio::test]
    async fn send_turn_appends_both_sides_to_the_session() {
        let provider = ScriptedProvider::with_replies([ScriptedReply::answer("pong")]);
        let mut threads = manager(provider.clone());
        let node = NodeId::new("a");
        threads.resolve_thread(&node, &[], None);

        let answer = threads
            .send_turn(&node, "ping", &[doc("notes.txt")])
            .await
            .unwrap();

        assert_eq!(answer, "pong");
        let thread = threads.thread(&node).unwrap();
        assert_eq!(thread.history().len(), 2);
        assert_eq!(thread.history()[0].attachments.len(), 1);
        assert_eq!(thread.history()[1].content, "pong");
        assert_eq!(thread.document_context().len(), 1);

        let request = &provider.requests()[0];
        assert_eq!(request.target.turn_id, 1);
        assert_eq!(request.prompt().unwrap().content, "ping");
    }

    #[tokio::test]
    async fn upstream_failures_are_classified() {
        let provider = ScriptedProvider::with_replies([
            ScriptedReply::new().fail("HTTP 401: invalid api key"),
            ScriptedReply::new().fail("blocked by safety system"),
            ScriptedReply::new().fail("connection reset"),
        ]);
        let mut threads = manager(provider);
        let node = NodeId::new("a");
        threads.resolve_thread(&node, &[], None);

        let credential = threads.send_turn(&node, "1", &[]).await.unwrap_err();
        let policy = threads.send_turn(&node, "2", &[]).await.unwrap_err();
        let other = threads.send_turn(&node, "3", &[]).await.unwrap_err();

        assert!(matches!(credential, ThreadError::InvalidCredential { .. }));
        assert!(matches!(policy, ThreadError::ContentPolicyViolation { .. }));
        assert!(matches!(other, ThreadError::UpstreamFailure { .. }));
        assert!(threads.thread(&node).unwrap().history().is_empty());
    }

    #[test]
    fn dispose_cancels_the_session() {
        let mut threads = manager(ScriptedProvider::new());
        let node = NodeId::new("a");
        threads.resolve_thread(&node, &[], None);
        let token = threads.thread(&node).unwrap().cancel.child_token();

        assert!(threads.dispose(&node));
        assert!(token.is_cancelled());
        assert!(!threads.dispose(&node));

        threads.resolve_thread(&NodeId::new("b"), &[], None);
        threads.dispose_all();
        assert!(threads.is_empty());
    }

    #[test]
    fn uncommitted_turns_do_not_adopt_documents() {
        let provider = ScriptedProvider::with_replies([ScriptedReply::answer("ok")]);
        let mut threads = manager(provider);
        let node = NodeId::new("a");
        threads.resolve_thread(&node, &[], None);

        let turn = threads.open_turn(&node, "read", &[doc("secret.txt")]).unwrap();
        assert!(threads.thread(&node).unwrap().document_context().is_empty());
        drop(turn);
        assert!(threads.thread(&node).unwrap().document_context().is_empty());

        let turn = threads.open_turn(&node, "again", &[doc("notes.txt")]).unwrap();
        threads
            .commit_turn(&node, turn.prompt, &turn.attachments, "done")
            .unwrap();
        let thread = threads.thread(&node).unwrap();
        assert!(thread.document_context().contains(&key("notes.txt")));
        assert!(!thread.document_context().contains(&key("secret.txt")));
    }

    #[test]
    fn seeded_threads_ignore_what_the_parent_holds_now() {
        let mut threads = manager(ScriptedProvider::new());
        let parent = NodeId::new("a");
        let child = NodeId::new("b");
        let later = vec![Message::user("docs", vec![doc("d1"), doc("d3")])];
        threads.resolve_thread(&parent, &later, None);

        let mut inherited = DocumentSet::new();
        inherited.insert(&doc("d1"));
        let own = vec![Message::user("mine", vec![doc("d4")])];
        let thread = threads.resolve_seeded(
            &child,
            Some(&parent),
            ThreadSeed {
                own_history: &own,
                replay: context::to_provider_history(&own),
                inherited,
            },
        );

        assert_eq!(thread.parent_thread_id(), Some(&parent));
        assert_eq!(thread.history().len(), 1);
        let effective = thread.effective_documents();
        assert!(effective.contains(&key("d1")));
        assert!(effective.contains(&key("d4")));
        assert!(!effective.contains(&key("d3")));
    }
}
