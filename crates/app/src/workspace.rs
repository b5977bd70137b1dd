//! One conversation tree wired to its sessions, provider and persistence.

use std::collections::HashMap;
use std::sync::Arc;

use arbor_llm::wire::{WireError, WireEventWriter};
use arbor_llm::{LlmProvider, ProviderStreamHandle, StreamEvent, StreamTarget};
use arbor_storage::{BlobStore, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assembler::{AssemblyError, AssemblyPhase, StreamAssembler};
use crate::context;
use crate::document::DocumentSet;
use crate::ids::NodeId;
use crate::message::{Attachment, Message, Role};
use crate::settings::Settings;
use crate::thread::{OpenTurn, ThreadContextManager, ThreadError, ThreadSeed};
use crate::title::{LabelUpdate, TitleJob, spawn_title_task};
use crate::tree::{TreeError, TreeResult, TreeSnapshot, TreeStore};

pub const TREE_BLOB_KEY: &str = "arbor.tree";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WorkspaceError {
    #[snafu(display("tree operation failed on `{stage}`: {source}"))]
    Tree {
        stage: &'static str,
        source: TreeError,
    },
    #[snafu(display("turn assembly failed on `{stage}`: {source}"))]
    Assembly {
        stage: &'static str,
        source: AssemblyError,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to encode tree snapshot on `{stage}`: {source}"))]
    EncodeSnapshot {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode tree snapshot on `{stage}`: {source}"))]
    DecodeSnapshot {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to relay stream events on `{stage}`: {source}"))]
    Relay {
        stage: &'static str,
        source: WireError,
    },
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// How a submitted turn ended. Upstream failures are data here, not errors.
#[derive(Debug)]
pub enum TurnOutcome {
    Completed { message: Message },
    Failed { error: ThreadError },
    Cancelled {
        restored_input: String,
        restored_attachments: Vec<Attachment>,
    },
}

enum StreamEnd {
    Completed,
    Errored(String),
    Closed,
    Cancelled,
}

pub struct Workspace {
    tree: TreeStore,
    threads: ThreadContextManager,
    store: Arc<dyn BlobStore>,
    settings: Arc<Settings>,
    active: NodeId,
    label_tx: mpsc::UnboundedSender<LabelUpdate>,
    label_rx: mpsc::UnboundedReceiver<LabelUpdate>,
    title_tasks: Vec<JoinHandle<()>>,
    title_requests: u64,
    /// Label generation per node; nodes without an entry are at `label_floor`.
    label_generations: HashMap<NodeId, u64>,
    label_floor: u64,
    label_clock: u64,
    event_mirror: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl Workspace {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn BlobStore>,
        settings: Arc<Settings>,
    ) -> Self {
        let (label_tx, label_rx) = mpsc::unbounded_channel();
        Self {
            tree: TreeStore::new(),
            threads: ThreadContextManager::new(provider, settings.turn_options(None)),
            store,
            settings,
            active: NodeId::root(),
            label_tx,
            label_rx,
            title_tasks: Vec::new(),
            title_requests: 0,
            label_generations: HashMap::new(),
            label_floor: 0,
            label_clock: 0,
            event_mirror: None,
        }
    }

    pub fn tree(&self) -> &TreeStore {
        &self.tree
    }

    pub fn threads(&self) -> &ThreadContextManager {
        &self.threads
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: Arc<Settings>) {
        self.threads.set_options(settings.turn_options(None));
        self.settings = settings;
    }

    pub fn active_node(&self) -> &NodeId {
        &self.active
    }

    /// Mirrors every consumed stream event into `mirror` (see [`relay`]).
    pub fn set_event_mirror(&mut self, mirror: Option<mpsc::UnboundedSender<StreamEvent>>) {
        self.event_mirror = mirror;
    }

    pub fn select(&mut self, node_id: &NodeId) -> WorkspaceResult<()> {
        self.tree.node(node_id).context(TreeSnafu {
            stage: "workspace-select",
        })?;
        self.active = node_id.clone();
        Ok(())
    }

    /// Creates a child of `source_id`. When the source already has a session, the new
    /// node's session is created now so it snapshots the source's documents.
    pub fn branch(&mut self, source_id: &NodeId, label: &str) -> WorkspaceResult<NodeId> {
        let new_id = self
            .tree
            .create_branch(source_id, label)
            .context(TreeSnafu {
                stage: "workspace-branch",
            })?;

        if self.threads.thread(source_id).is_some() {
            let seed = thread_seed(&self.tree, &new_id).context(TreeSnafu {
                stage: "workspace-branch-seed",
            })?;
            self.threads.resolve_seeded(&new_id, Some(source_id), seed);
        }
        Ok(new_id)
    }

    /// Clears the node and drops its subtree. Titles still being generated for the
    /// node are discarded when they arrive.
    pub fn reset(&mut self, node_id: &NodeId) -> Vec<NodeId> {
        let removed = self.tree.reset_node(node_id);
        self.threads.dispose(node_id);
        self.label_clock += 1;
        self.label_generations.insert(node_id.clone(), self.label_clock);
        self.forget(&removed, node_id);
        removed
    }

    pub fn delete(&mut self, node_id: &NodeId) -> WorkspaceResult<Vec<NodeId>> {
        let fallback = self.tree.parent(node_id).cloned().unwrap_or_else(NodeId::root);
        let removed = self
            .tree
            .delete_node_and_descendants(node_id)
            .context(TreeSnafu {
                stage: "workspace-delete",
            })?;
        self.forget(&removed, &fallback);
        Ok(removed)
    }

    fn forget(&mut self, removed: &[NodeId], fallback: &NodeId) {
        for id in removed {
            self.threads.dispose(id);
            self.label_generations.remove(id);
        }
        if removed.contains(&self.active) {
            self.active = fallback.clone();
        }
    }

    /// Runs one turn at `node_id` and records it in the tree.
    ///
    /// Only pre-flight problems (unknown node) are returned as `Err`. Upstream failures
    /// end as a model-role error message and [`TurnOutcome::Failed`]. Cancelling
    /// `cancel` removes everything the turn added and hands `input` back.
    pub async fn submit(
        &mut self,
        node_id: &NodeId,
        input: &str,
        attachments: Vec<Attachment>,
        cancel: CancellationToken,
    ) -> WorkspaceResult<TurnOutcome> {
        self.apply_label_updates();

        let parent = self.tree.parent(node_id).cloned();
        let seed = thread_seed(&self.tree, node_id).context(TreeSnafu {
            stage: "workspace-submit-seed",
        })?;
        self.threads.resolve_seeded(node_id, parent.as_ref(), seed);

        // Only the node's own messages feed its documents. Ancestors contribute
        // through the inherited set fixed at branch time.
        let own_history = self.tree.history(node_id).context(TreeSnafu {
            stage: "workspace-submit-own-history",
        })?;
        self.threads.refresh_documents(node_id, own_history);
        let restore_len = own_history.len();
        let first_exchange = !own_history
            .iter()
            .any(|message| message.role == Role::Model && !message.is_error);

        self.tree
            .append_message(node_id, Message::user(input, attachments.clone()))
            .context(TreeSnafu {
                stage: "workspace-submit-user-message",
            })?;

        let turn = match self.threads.open_turn(node_id, input, &attachments) {
            Ok(turn) => turn,
            Err(error) => {
                tracing::warn!(node_id = %node_id, error = %error, "failed to open turn");
                self.record_failure(node_id, None, &error)?;
                return Ok(TurnOutcome::Failed { error });
            }
        };
        let OpenTurn {
            target,
            handle,
            prompt,
            session_cancel,
            ..
        } = turn;

        let mut assembler =
            StreamAssembler::new(target, Some(self.threads.options().model_id.clone()));
        let placeholder = assembler.start().context(AssemblySnafu {
            stage: "workspace-submit-start",
        })?;
        let index = self
            .tree
            .append_message(node_id, placeholder)
            .context(TreeSnafu {
                stage: "workspace-submit-placeholder",
            })?;

        let end = self
            .consume(node_id, index, &mut assembler, handle, &cancel, &session_cancel)
            .await?;

        match end {
            StreamEnd::Completed => {
                let message = assembler.message();
                let committed = self
                    .threads
                    .commit_turn(node_id, prompt, &attachments, &message.content);
                if let Err(error) = committed {
                    tracing::warn!(
                        node_id = %node_id,
                        error = %error,
                        "session vanished before commit"
                    );
                }
                if first_exchange {
                    self.request_title(node_id, input, &message.content);
                }
                tracing::info!(node_id = %node_id, target = ?target, "turn completed");
                Ok(TurnOutcome::Completed { message })
            }
            StreamEnd::Errored(message) => {
                let error = ThreadError::upstream("workspace-stream-error", message);
                self.record_failure(node_id, Some(index), &error)?;
                Ok(TurnOutcome::Failed { error })
            }
            StreamEnd::Closed => {
                let error = ThreadError::UpstreamFailure {
                    stage: "workspace-stream-closed",
                    message: "the response stream ended before completing".to_string(),
                };
                self.record_failure(node_id, Some(index), &error)?;
                Ok(TurnOutcome::Failed { error })
            }
            StreamEnd::Cancelled => {
                self.tree
                    .truncate_history(node_id, restore_len)
                    .context(TreeSnafu {
                        stage: "workspace-submit-cancel-truncate",
                    })?;
                tracing::info!(node_id = %node_id, target = ?target, "turn cancelled");
                Ok(TurnOutcome::Cancelled {
                    restored_input: input.to_string(),
                    restored_attachments: attachments,
                })
            }
        }
    }

    async fn consume(
        &mut self,
        node_id: &NodeId,
        index: usize,
        assembler: &mut StreamAssembler,
        handle: ProviderStreamHandle,
        cancel: &CancellationToken,
        session_cancel: &CancellationToken,
    ) -> WorkspaceResult<StreamEnd> {
        let ProviderStreamHandle { mut stream, worker } = handle;
        let worker_task = tokio::spawn(worker);

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                _ = session_cancel.cancelled() => break StreamEnd::Cancelled,
                next = stream.recv() => next,
            };
            let Some(event) = next else {
                break StreamEnd::Closed;
            };

            self.mirror(&event);
            match assembler.apply(&event) {
                Ok(message) => self
                    .tree
                    .replace_message(node_id, index, message)
                    .context(TreeSnafu {
                        stage: "workspace-consume-replace",
                    })?,
                Err(error) => {
                    tracing::warn!(node_id = %node_id, error = %error, "ignoring stream event");
                    continue;
                }
            }

            match assembler.phase() {
                AssemblyPhase::Complete => break StreamEnd::Completed,
                AssemblyPhase::Errored { message } => break StreamEnd::Errored(message.clone()),
                AssemblyPhase::Idle | AssemblyPhase::Thinking | AssemblyPhase::Answering => {}
            }
        };

        drop(stream);
        match end {
            StreamEnd::Cancelled => worker_task.abort(),
            _ => {
                if let Err(error) = worker_task.await {
                    tracing::warn!(
                        node_id = %node_id,
                        error = %error,
                        "provider worker did not finish cleanly"
                    );
                }
            }
        }
        Ok(end)
    }

    fn mirror(&mut self, event: &StreamEvent) {
        let closed = self
            .event_mirror
            .as_ref()
            .is_some_and(|mirror| mirror.send(event.clone()).is_err());
        if closed {
            tracing::debug!("event mirror closed");
            self.event_mirror = None;
        }
    }

    /// Leaves partial content in place and adds the error as a model message. An
    /// untouched placeholder is replaced instead of kept.
    fn record_failure(
        &mut self,
        node_id: &NodeId,
        placeholder: Option<usize>,
        error: &ThreadError,
    ) -> WorkspaceResult<()> {
        tracing::warn!(node_id = %node_id, error = %error, "turn failed");
        let message = Message::model_error(
            error.user_message(),
            Some(self.threads.options().model_id.clone()),
        );

        let empty_placeholder = placeholder.filter(|index| {
            self.tree
                .history(node_id)
                .ok()
                .and_then(|history| history.get(*index))
                .is_some_and(Message::is_empty_placeholder)
        });
        let recorded = match empty_placeholder {
            Some(index) => self.tree.replace_message(node_id, index, message),
            None => self.tree.append_message(node_id, message).map(|_| ()),
        };
        recorded.context(TreeSnafu {
            stage: "workspace-record-failure",
        })
    }

    fn request_title(&mut self, node_id: &NodeId, input: &str, reply: &str) {
        self.title_requests += 1;
        self.title_tasks.retain(|task| !task.is_finished());
        let job = TitleJob {
            node_id: node_id.clone(),
            generation: self.label_generation(node_id),
            user_text: input.to_string(),
            reply: reply.to_string(),
        };
        self.title_tasks.push(spawn_title_task(
            self.threads.provider(),
            self.settings.title_options(),
            StreamTarget::new(0, self.title_requests),
            job,
            self.label_tx.clone(),
        ));
    }

    fn label_generation(&self, node_id: &NodeId) -> u64 {
        self.label_generations
            .get(node_id)
            .copied()
            .unwrap_or(self.label_floor)
    }

    /// Invalidates every label request made so far.
    fn retire_labels(&mut self) {
        self.label_clock += 1;
        self.label_floor = self.label_clock;
        self.label_generations.clear();
    }

    /// Applies finished label updates. Only ever writes labels.
    pub fn apply_label_updates(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.label_rx.try_recv() {
            let current = self.label_generation(&update.node_id);
            if update.generation != current {
                tracing::debug!(
                    node_id = %update.node_id,
                    generation = update.generation,
                    current,
                    "dropping stale label update"
                );
                continue;
            }
            match self.tree.set_label(&update.node_id, update.label) {
                Ok(()) => applied += 1,
                Err(error) => {
                    tracing::debug!(
                        node_id = %update.node_id,
                        error = %error,
                        "dropping label update"
                    );
                }
            }
        }
        applied
    }

    /// Waits for every outstanding title task, then applies their updates.
    pub async fn settle_labels(&mut self) -> usize {
        for task in self.title_tasks.drain(..) {
            if let Err(error) = task.await {
                tracing::warn!(error = %error, "title task did not finish cleanly");
            }
        }
        self.apply_label_updates()
    }

    pub fn save(&self) -> WorkspaceResult<()> {
        let snapshot = self.tree.snapshot(&self.active);
        let blob = serde_json::to_string(&snapshot).context(EncodeSnapshotSnafu {
            stage: "workspace-save-encode",
        })?;
        self.store.set(TREE_BLOB_KEY, &blob).context(StorageSnafu {
            stage: "workspace-save",
        })?;
        tracing::debug!(nodes = snapshot.nodes.len(), bytes = blob.len(), "saved tree");
        Ok(())
    }

    /// Replaces the in-memory tree with the stored one. Returns false when nothing was
    /// stored, leaving a fresh tree.
    pub fn load(&mut self) -> WorkspaceResult<bool> {
        let blob = self.store.get(TREE_BLOB_KEY).context(StorageSnafu {
            stage: "workspace-load",
        })?;
        self.threads.dispose_all();
        self.retire_labels();

        let Some(blob) = blob else {
            self.tree = TreeStore::new();
            self.active = NodeId::root();
            return Ok(false);
        };

        let snapshot: TreeSnapshot = serde_json::from_str(&blob).context(DecodeSnapshotSnafu {
            stage: "workspace-load-decode",
        })?;
        let (tree, active) = TreeStore::from_snapshot(snapshot);
        tracing::info!(nodes = tree.len(), active = %active, "loaded tree");
        self.tree = tree;
        self.active = active;
        Ok(true)
    }

    /// Drops the stored tree and starts over.
    pub fn clear(&mut self) -> WorkspaceResult<()> {
        self.store.clear(TREE_BLOB_KEY).context(StorageSnafu {
            stage: "workspace-clear",
        })?;
        self.threads.dispose_all();
        self.retire_labels();
        self.tree = TreeStore::new();
        self.active = NodeId::root();
        Ok(())
    }
}

/// Starting state for a node's thread, read from the tree: its own messages, the
/// assembled conversation, and the documents its ancestors held at branch time.
fn thread_seed<'a>(tree: &'a TreeStore, node_id: &NodeId) -> TreeResult<ThreadSeed<'a>> {
    Ok(ThreadSeed {
        own_history: tree.history(node_id)?,
        replay: context::assemble(tree, node_id)?,
        inherited: DocumentSet::from_history(&tree.history_at_branch(node_id)?),
    })
}

/// Writes mirrored events as wire records until every sender is gone.
pub async fn relay<W>(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    mut writer: WireEventWriter<W>,
) -> WorkspaceResult<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        writer.write(&event.payload).await.context(RelaySnafu {
            stage: "workspace-relay-write",
        })?;
    }
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use arbor_llm::wire::WireEventReader;
    use arbor_llm::{ScriptedProvider, ScriptedReply, StreamEventPayload, StreamRequest};
    use arbor_storage::MemoryBlobStore;

    use super::*;
    use crate::document::DocumentKey;
    use crate::tree::ROOT_LABEL;

    fn workspace(provider: ScriptedProvider) -> (Workspace, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryBlobStore::new());
        let workspace = Workspace::new(
            Arc::new(provider),
            store.clone(),
            Arc::new(Settings::default()),
        );
        (workspace, store)
    }

    fn doc(name: &str) -> Attachment {
        Attachment::new(name, "text/plain", "ZG9j")
    }

    fn key(name: &str) -> DocumentKey {
        DocumentKey {
            name: name.to_string(),
            mime_type: "text/plain".to_string(),
        }
    }

    async fn submit(workspace: &mut Workspace, node: &NodeId, input: &str) -> TurnOutcome {
        workspace
            .submit(node, input, Vec::new(), CancellationToken::new())
            .await
            .unwrap()
    }

    async fn submit_with(
        workspace: &mut Workspace,
        node: &NodeId,
        input: &str,
        attachments: Vec<Attachment>,
    ) -> TurnOutcome {
        workspace
            .submit(node, input, attachments, CancellationToken::new())
            .await
            .unwrap()
    }

    /// The most recent conversation turn, skipping title requests.
    fn last_turn(provider: &ScriptedProvider) -> StreamRequest {
        provider
            .requests()
            .into_iter()
            .rfind(|request| request.target.session_id != 0)
            .unwrap()
    }

    /// Names of every attachment that went upstream with `request`.
    fn sent_names(request: &StreamRequest) -> Vec<String> {
        let inline = request
            .messages
            .iter()
            .flat_map(|message| &message.attachments);
        request
            .documents
            .iter()
            .chain(inline)
            .map(|attachment| attachment.name.clone())
            .collect()
    }

    #[tokio::test]
    async fn streamed_reply_is_stored_on_the_node() {
        let provider = ScriptedProvider::with_replies([
            ScriptedReply::new().thought("abc").message("xyz").complete(),
            ScriptedReply::answer("\"Greeting.\""),
        ]);
        let (mut workspace, _) = workspace(provider);
        let root = NodeId::root();

        let outcome = submit(&mut workspace, &root, "hi").await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));

        let history = workspace.tree().history(&root).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].display_text(), "Thoughts:abc\n---\nAnswer:xyz");
        assert_eq!(workspace.threads().thread(&root).unwrap().history().len(), 2);

        assert_eq!(workspace.tree().node(&root).unwrap().label, ROOT_LABEL);
        assert_eq!(workspace.settle_labels().await, 1);
        assert_eq!(workspace.tree().node(&root).unwrap().label, "Greeting");
    }

    #[tokio::test]
    async fn cancelling_restores_the_input_and_history() {
        let provider = ScriptedProvider::with_replies([ScriptedReply::new()
            .thought("let me see")
            .message("par")
            .hang()]);
        let (mut workspace, _) = workspace(provider);
        let root = NodeId::root();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = workspace
            .submit(&root, "hello", Vec::new(), cancel)
            .await
            .unwrap();

        match outcome {
            TurnOutcome::Cancelled {
                restored_input,
                restored_attachments,
            } => {
                assert_eq!(restored_input, "hello");
                assert!(restored_attachments.is_empty());
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(workspace.tree().history(&root).unwrap().is_empty());
        assert!(workspace.threads().thread(&root).unwrap().history().is_empty());
    }

    #[tokio::test]
    async fn cancelled_attachments_are_handed_back_and_not_resent() {
        let provider = ScriptedProvider::with_replies([ScriptedReply::new().message("par").hang()]);
        let (mut workspace, _) = workspace(provider.clone());
        let root = NodeId::root();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let outcome = workspace
            .submit(&root, "hello", vec![doc("secret.txt")], cancel)
            .await
            .unwrap();

        match outcome {
            TurnOutcome::Cancelled {
                restored_attachments,
                ..
            } => assert_eq!(restored_attachments, vec![doc("secret.txt")]),
            other => panic!("expected cancellation, got {other:?}"),
        }
        let documents = workspace.threads().effective_documents(&root).unwrap();
        assert!(!documents.contains(&key("secret.txt")));

        submit(&mut workspace, &root, "next").await;
        let request = last_turn(&provider);
        assert_eq!(request.prompt().unwrap().content, "next");
        assert!(sent_names(&request).is_empty());
    }

    #[tokio::test]
    async fn upstream_errors_become_model_messages_and_keep_partial_content() {
        let provider = ScriptedProvider::with_replies([
            ScriptedReply::new().message("partial").fail("HTTP 401 Unauthorized"),
            ScriptedReply::new().fail("overloaded"),
        ]);
        let (mut workspace, _) = workspace(provider);
        let root = NodeId::root();

        let outcome = submit(&mut workspace, &root, "first").await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                error: ThreadError::InvalidCredential { .. }
            }
        ));
        let history = workspace.tree().history(&root).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].content, "partial");
        assert!(history[2].is_error);
        assert_eq!(history[2].role, Role::Model);

        let outcome = submit(&mut workspace, &root, "second").await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                error: ThreadError::UpstreamFailure { .. }
            }
        ));
        let history = workspace.tree().history(&root).unwrap();
        assert_eq!(history.len(), 5);
        assert!(history[4].is_error);

        // The tree stays usable and failed turns are not replayed.
        let outcome = submit(&mut workspace, &root, "third").await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn submitting_to_an_unknown_node_is_an_error() {
        let (mut workspace, _) = workspace(ScriptedProvider::new());
        let result = workspace
            .submit(&NodeId::new("ghost"), "hi", Vec::new(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(WorkspaceError::Tree { .. })));
    }

    #[tokio::test]
    async fn branches_snapshot_documents_at_branch_time() {
        let (mut workspace, _) = workspace(ScriptedProvider::new());
        let root = NodeId::root();
        workspace
            .submit(&root, "read", vec![doc("d1"), doc("d2")], CancellationToken::new())
            .await
            .unwrap();

        let child = workspace.branch(&root, "side").unwrap();
        workspace
            .submit(&root, "and this", vec![doc("d3")], CancellationToken::new())
            .await
            .unwrap();

        let documents = workspace.threads().effective_documents(&child).unwrap();
        assert!(documents.contains(&key("d1")));
        assert!(documents.contains(&key("d2")));
        assert!(!documents.contains(&key("d3")));
    }

    #[tokio::test]
    async fn parent_documents_added_later_stay_out_of_child_turns() {
        let provider = ScriptedProvider::new();
        let (mut workspace, _) = workspace(provider.clone());
        let root = NodeId::root();
        submit_with(&mut workspace, &root, "read", vec![doc("d1"), doc("d2")]).await;
        let child = workspace.branch(&root, "side").unwrap();
        submit_with(&mut workspace, &root, "and this", vec![doc("d3")]).await;

        submit(&mut workspace, &child, "what do you see").await;

        let documents = workspace.threads().effective_documents(&child).unwrap();
        assert!(documents.contains(&key("d1")));
        assert!(!documents.contains(&key("d3")));
        let sent = sent_names(&last_turn(&provider));
        assert!(sent.contains(&"d1".to_string()));
        assert!(!sent.contains(&"d3".to_string()));
    }

    #[tokio::test]
    async fn threads_rebuilt_after_load_keep_the_branch_snapshot() {
        let (mut workspace, store) = workspace(ScriptedProvider::new());
        let root = NodeId::root();
        submit_with(&mut workspace, &root, "read", vec![doc("d1"), doc("d2")]).await;
        workspace.save().unwrap();

        let provider = ScriptedProvider::new();
        let mut restored = Workspace::new(
            Arc::new(provider.clone()),
            store,
            Arc::new(Settings::default()),
        );
        assert!(restored.load().unwrap());
        let child = restored.branch(&root, "side").unwrap();
        assert!(restored.threads().thread(&child).is_none());
        submit_with(&mut restored, &root, "and this", vec![doc("d3")]).await;

        submit(&mut restored, &child, "what do you see").await;

        let documents = restored.threads().effective_documents(&child).unwrap();
        assert!(documents.contains(&key("d1")));
        assert!(documents.contains(&key("d2")));
        assert!(!documents.contains(&key("d3")));
        let request = last_turn(&provider);
        let contents: Vec<_> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["read", "echo: read", "what do you see"]);
        assert!(!sent_names(&request).contains(&"d3".to_string()));
    }

    #[tokio::test]
    async fn titles_requested_before_a_reset_are_dropped() {
        let provider = ScriptedProvider::with_replies([
            ScriptedReply::answer("hello there"),
            ScriptedReply::answer("\"Greeting Title\""),
            ScriptedReply::answer("again"),
            ScriptedReply::answer("\"Second Title\""),
        ]);
        let (mut workspace, _) = workspace(provider);
        let node = workspace.branch(&NodeId::root(), "").unwrap();

        submit(&mut workspace, &node, "hi").await;
        workspace.reset(&node);
        assert_eq!(workspace.settle_labels().await, 0);
        assert_eq!(workspace.tree().node(&node).unwrap().label, "");

        submit(&mut workspace, &node, "hi again").await;
        assert_eq!(workspace.settle_labels().await, 1);
        assert_eq!(workspace.tree().node(&node).unwrap().label, "Second Title");
    }

    #[tokio::test]
    async fn child_turns_replay_the_parent_path() {
        let provider = ScriptedProvider::new();
        let (mut workspace, _) = workspace(provider.clone());
        let root = NodeId::root();
        submit(&mut workspace, &root, "one").await;
        let child = workspace.branch(&root, "b").unwrap();

        submit(&mut workspace, &child, "two").await;

        let request = provider
            .requests()
            .into_iter()
            .rfind(|request| request.target.turn_id == 1 && request.target.session_id != 0)
            .unwrap();
        let contents: Vec<_> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "echo: one", "two"]);
    }

    #[tokio::test]
    async fn delete_and_reset_dispose_sessions() {
        let (mut workspace, _) = workspace(ScriptedProvider::new());
        let root = NodeId::root();
        let a = workspace.branch(&root, "a").unwrap();
        let b = workspace.branch(&a, "b").unwrap();
        submit(&mut workspace, &b, "deep").await;
        workspace.select(&b).unwrap();
        assert!(workspace.threads().thread(&b).is_some());

        let removed = workspace.delete(&a).unwrap();
        assert_eq!(removed, vec![a.clone(), b.clone()]);
        assert!(workspace.threads().thread(&b).is_none());
        assert_eq!(workspace.active_node(), &root);

        submit(&mut workspace, &root, "top").await;
        workspace.reset(&root);
        assert!(workspace.threads().is_empty());
        assert!(workspace.tree().history(&root).unwrap().is_empty());

        assert!(matches!(
            workspace.delete(&root),
            Err(WorkspaceError::Tree {
                source: TreeError::InvalidOperation { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn tree_survives_save_and_load() {
        let (mut workspace, store) = workspace(ScriptedProvider::new());
        let root = NodeId::root();
        submit(&mut workspace, &root, "persist me").await;
        let child = workspace.branch(&root, "kept").unwrap();
        workspace.select(&child).unwrap();
        workspace.save().unwrap();

        let mut restored = Workspace::new(
            Arc::new(ScriptedProvider::new()),
            store.clone(),
            Arc::new(Settings::default()),
        );
        assert!(restored.load().unwrap());
        assert_eq!(restored.active_node(), &child);
        assert_eq!(restored.tree().node(&child).unwrap().label, "kept");
        assert_eq!(restored.tree().history(&root).unwrap().len(), 2);

        restored.clear().unwrap();
        assert_eq!(restored.tree().len(), 1);
        assert!(!restored.load().unwrap());
    }

    #[tokio::test]
    async fn mirrored_events_are_relayed_as_wire_records() {
        let provider = ScriptedProvider::with_replies([ScriptedReply::new()
            .thought("t")
            .message("m")
            .complete()]);
        let (mut workspace, _) = workspace(provider);
        let (tx, rx) = mpsc::unbounded_channel();
        workspace.set_event_mirror(Some(tx));

        submit(&mut workspace, &NodeId::root(), "go").await;
        workspace.set_event_mirror(None);

        let bytes = relay(rx, WireEventWriter::new(Vec::new())).await.unwrap();
        let mut reader = WireEventReader::new(bytes.as_slice());
        let mut payloads = Vec::new();
        while let Some(payload) = reader.next_event().await.unwrap() {
            payloads.push(payload);
        }

        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::ThoughtDelta("t".to_string()),
                StreamEventPayload::MessageDelta("m".to_string()),
                StreamEventPayload::Complete { audio: None },
            ]
        );
    }
}
