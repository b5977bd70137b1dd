use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use arbor::settings::ModelSettings;
use arbor::workspace::WorkspaceResult;
use arbor::{Attachment, NodeId, SettingsStore, TurnOutcome, Workspace, relay};
use arbor_llm::wire::WireEventWriter;
use arbor_llm::{LlmProvider, ProviderError, ScriptedProvider, create_provider};
use arbor_storage::{SqliteBlobStore, StorageError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Parser;
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "arbor")]
#[command(about = "Branching conversations with a language model")]
#[command(version)]
struct Cli {
    /// SQLite file holding the conversation tree
    #[arg(long, env = "ARBOR_DATABASE")]
    database: Option<PathBuf>,

    /// Settings file to use instead of the one in the config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model for new turns; must be known to the provider
    #[arg(long)]
    model: Option<String>,

    /// Answer with the built-in scripted provider instead of the network
    #[arg(long, default_value = "false")]
    offline: bool,

    /// Mirror stream events on stdout as newline-delimited JSON
    #[arg(long, default_value = "false")]
    ndjson: bool,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to set up the provider: {source}"))]
    Provider { source: ProviderError },
    #[snafu(display("failed to open the database: {source}"))]
    Storage { source: StorageError },
    #[snafu(display("{source}"))]
    Workspace {
        source: arbor::workspace::WorkspaceError,
    },
    #[snafu(display("terminal i/o failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Submit(String),
    Branch(String),
    Go(String),
    Reset,
    Delete,
    Path,
    Tree,
    Attach(PathBuf),
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Submit(line.to_string());
    };

    let (name, argument) = rest
        .split_once(char::is_whitespace)
        .map(|(name, argument)| (name, argument.trim()))
        .unwrap_or((rest, ""));
    match name {
        "branch" => Command::Branch(argument.to_string()),
        "go" if !argument.is_empty() => Command::Go(argument.to_string()),
        "reset" => Command::Reset,
        "delete" => Command::Delete,
        "path" => Command::Path,
        "tree" => Command::Tree,
        "attach" if !argument.is_empty() => Command::Attach(PathBuf::from(argument)),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    }
}

const HELP: &str = "\
  <text>           send a turn at the active node
  /branch <label>  create a child of the active node and switch to it
  /go <id>         switch to a node (unique id prefix is enough)
  /reset           clear the active node and drop its subtree
  /delete          delete the active node and its subtree
  /path            show the route from the root to the active node
  /tree            show the whole tree
  /attach <path>   attach a file to the next turn
  /quit            leave
Ctrl-C while a reply streams cancels the turn.";

fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "rs" => "text/x-rust",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "xml" => "application/xml",
        "js" => "application/javascript",
        "py" => "application/x-python",
        "sh" => "application/x-sh",
        "yaml" | "yml" => "application/x-yaml",
        "toml" => "application/toml",
        "sql" => "application/sql",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

async fn read_attachment(path: &Path) -> std::io::Result<Attachment> {
    let bytes = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Attachment::new(
        name,
        guess_mime_type(path),
        BASE64.encode(bytes),
    ))
}

fn resolve_node(workspace: &Workspace, prefix: &str) -> Option<NodeId> {
    let matches = workspace
        .tree()
        .nodes_breadth_first()
        .into_iter()
        .filter(|node| node.id.as_str().starts_with(prefix))
        .map(|node| node.id.clone())
        .collect::<Vec<_>>();
    match matches.as_slice() {
        [only] => Some(only.clone()),
        _ => None,
    }
}

fn render_tree(workspace: &Workspace) -> String {
    let tree = workspace.tree();
    let mut lines = Vec::new();
    let mut stack = vec![(NodeId::root(), 0usize)];
    while let Some((id, depth)) = stack.pop() {
        let Ok(node) = tree.node(&id) else {
            continue;
        };
        let marker = if &id == workspace.active_node() { "*" } else { " " };
        lines.push(format!(
            "{marker} {}{} [{}] ({} messages)",
            "  ".repeat(depth),
            node.label,
            id,
            node.chat_history.len()
        ));
        for child in tree.children(&id).into_iter().rev() {
            stack.push((child, depth + 1));
        }
    }
    lines.join("\n")
}

fn build_provider(cli: &Cli, store: &SettingsStore) -> Result<Arc<dyn LlmProvider>, CliError> {
    if cli.offline {
        tracing::info!("using the scripted provider");
        return Ok(Arc::new(ScriptedProvider::new()));
    }
    create_provider(store.settings().to_provider_config()).context(ProviderSnafu)
}

async fn print(line: &str) -> Result<(), CliError> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{line}\n").as_bytes())
        .await
        .context(TerminalSnafu { stage: "print" })?;
    stdout.flush().await.context(TerminalSnafu { stage: "flush" })
}

/// Forwards every Ctrl-C of the session. Installed once so the signal never falls
/// back to its default handling between turns.
fn listen_for_interrupts() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Runs a turn at the active node. Ctrl-C cancels it; the REPL keeps going.
async fn run_turn(
    workspace: &mut Workspace,
    input: &str,
    attachments: Vec<Attachment>,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> WorkspaceResult<TurnOutcome> {
    let node_id = workspace.active_node().clone();
    let cancel = CancellationToken::new();
    let submit = workspace.submit(&node_id, input, attachments, cancel.clone());
    tokio::pin!(submit);

    loop {
        tokio::select! {
            outcome = &mut submit => return outcome,
            Some(()) = interrupts.recv() => {
                tracing::debug!(node_id = %node_id, "cancelling turn");
                cancel.cancel();
            }
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let settings_store = SettingsStore::new(
        cli.config
            .clone()
            .unwrap_or_else(SettingsStore::default_config_path),
    );
    if let Some(database) = cli.database.clone() {
        settings_store.override_with(|settings| settings.database_path = Some(database));
    }
    if let Some(model) = cli.model.clone() {
        settings_store.override_with(|settings| {
            let entry = settings
                .models
                .iter()
                .position(|entry| entry.model_name == model)
                .map(|index| settings.models.remove(index))
                .unwrap_or_else(|| ModelSettings {
                    model_name: model,
                    ..ModelSettings::default()
                });
            settings.models.insert(0, entry);
        });
    }

    let settings = settings_store.settings();
    let provider = build_provider(&cli, &settings_store)?;
    let database_path = settings.database_path();
    let store = SqliteBlobStore::open(&database_path.to_string_lossy())
        .await
        .context(StorageSnafu)?;

    let mut workspace = Workspace::new(provider, Arc::new(store), settings);
    if workspace.load().context(WorkspaceSnafu)? {
        tracing::info!(nodes = workspace.tree().len(), "restored conversation tree");
    }

    let relay_task = if cli.ndjson {
        let (tx, rx) = mpsc::unbounded_channel();
        workspace.set_event_mirror(Some(tx));
        Some(tokio::spawn(relay(
            rx,
            WireEventWriter::new(tokio::io::stdout()),
        )))
    } else {
        None
    };

    print("arbor: type /help for commands").await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupts = listen_for_interrupts();
    let mut pending: Vec<Attachment> = Vec::new();

    loop {
        let next = tokio::select! {
            line = lines.next_line() => line.context(TerminalSnafu { stage: "read-line" })?,
            Some(()) = interrupts.recv() => {
                tracing::info!("interrupted at the prompt");
                None
            }
        };
        let Some(line) = next else {
            break;
        };

        let applied = workspace.apply_label_updates();
        if applied > 0 {
            workspace.save().context(WorkspaceSnafu)?;
        }

        match parse_command(&line) {
            Command::Submit(text) if text.is_empty() => continue,
            Command::Submit(text) => {
                let attachments = std::mem::take(&mut pending);
                match run_turn(&mut workspace, &text, attachments, &mut interrupts)
                    .await
                    .context(WorkspaceSnafu)?
                {
                    TurnOutcome::Completed { message } => {
                        if !cli.ndjson {
                            print(&message.display_text()).await?;
                        }
                    }
                    TurnOutcome::Failed { error } => {
                        print(&format!("! {}", error.user_message())).await?;
                    }
                    TurnOutcome::Cancelled {
                        restored_input,
                        restored_attachments,
                    } => {
                        print(&format!("(cancelled) {restored_input}")).await?;
                        if !restored_attachments.is_empty() {
                            print(&format!(
                                "{} attachment(s) kept for the next turn",
                                restored_attachments.len()
                            ))
                            .await?;
                        }
                        pending.extend(restored_attachments);
                    }
                }
            }
            Command::Branch(label) => {
                let source = workspace.active_node().clone();
                let label = if label.is_empty() { "New branch" } else { label.as_str() };
                let id = workspace.branch(&source, label).context(WorkspaceSnafu)?;
                workspace.select(&id).context(WorkspaceSnafu)?;
                print(&format!("on {id}")).await?;
            }
            Command::Go(prefix) => match resolve_node(&workspace, &prefix) {
                Some(id) => {
                    workspace.select(&id).context(WorkspaceSnafu)?;
                    print(&format!("on {id}")).await?;
                }
                None => print(&format!("no unique node matches '{prefix}'")).await?,
            },
            Command::Reset => {
                let node_id = workspace.active_node().clone();
                let removed = workspace.reset(&node_id);
                print(&format!("reset {node_id}, removed {} nodes", removed.len())).await?;
            }
            Command::Delete => {
                let node_id = workspace.active_node().clone();
                match workspace.delete(&node_id) {
                    Ok(removed) => {
                        print(&format!(
                            "deleted {} nodes, now on {}",
                            removed.len(),
                            workspace.active_node()
                        ))
                        .await?
                    }
                    Err(error) => print(&format!("! {error}")).await?,
                }
            }
            Command::Path => {
                let path = workspace
                    .tree()
                    .path_to_root(workspace.active_node())
                    .map_err(|error| error.to_string());
                match path {
                    Ok(path) => {
                        let labels = path
                            .iter()
                            .filter_map(|id| workspace.tree().node(id).ok())
                            .map(|node| node.label.clone())
                            .collect::<Vec<_>>();
                        print(&labels.join(" > ")).await?;
                    }
                    Err(error) => print(&format!("! {error}")).await?,
                }
            }
            Command::Tree => print(&render_tree(&workspace)).await?,
            Command::Attach(path) => match read_attachment(&path).await {
                Ok(attachment) => {
                    print(&format!(
                        "attached {} ({})",
                        attachment.name, attachment.mime_type
                    ))
                    .await?;
                    pending.push(attachment);
                }
                Err(error) => {
                    print(&format!("! cannot read {}: {error}", path.display())).await?
                }
            },
            Command::Help => print(HELP).await?,
            Command::Quit => break,
            Command::Unknown(line) => print(&format!("unknown command: {line}")).await?,
        }

        workspace.save().context(WorkspaceSnafu)?;
    }

    workspace.settle_labels().await;
    workspace.save().context(WorkspaceSnafu)?;
    workspace.set_event_mirror(None);
    if let Some(task) = relay_task {
        match task.await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => tracing::warn!(error = %error, "event relay failed"),
            Err(error) => tracing::warn!(error = %error, "event relay task did not finish"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "arbor exited with an error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_parse_into_commands() {
        assert_eq!(
            parse_command("  hello there "),
            Command::Submit("hello there".to_string())
        );
        assert_eq!(
            parse_command("/branch side quest"),
            Command::Branch("side quest".to_string())
        );
        assert_eq!(parse_command("/branch"), Command::Branch(String::new()));
        assert_eq!(parse_command("/go 0199"), Command::Go("0199".to_string()));
        assert_eq!(parse_command("/go"), Command::Unknown("/go".to_string()));
        assert_eq!(
            parse_command("/attach notes.txt"),
            Command::Attach(PathBuf::from("notes.txt"))
        );
        assert_eq!(parse_command("/quit"), Command::Quit);
    }

    #[test]
    fn mime_types_follow_the_extension() {
        assert_eq!(guess_mime_type(Path::new("a/notes.TXT")), "text/plain");
        assert_eq!(guess_mime_type(Path::new("report.pdf")), "application/pdf");
        assert_eq!(guess_mime_type(Path::new("photo.jpeg")), "image/jpeg");
        assert_eq!(guess_mime_type(Path::new("blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn one_interrupt_channel_cancels_every_turn() {
        let provider = ScriptedProvider::with_replies([
            arbor_llm::ScriptedReply::new().message("par").hang(),
            arbor_llm::ScriptedReply::new().message("tial").hang(),
        ]);
        let mut workspace = Workspace::new(
            Arc::new(provider),
            Arc::new(arbor_storage::MemoryBlobStore::new()),
            Arc::new(arbor::Settings::default()),
        );
        let (tx, mut interrupts) = mpsc::unbounded_channel();

        for input in ["first", "second"] {
            tx.send(()).unwrap();
            let outcome = run_turn(&mut workspace, input, Vec::new(), &mut interrupts)
                .await
                .unwrap();
            assert!(matches!(
                outcome,
                TurnOutcome::Cancelled { restored_input, .. } if restored_input == input
            ));
        }
        assert!(workspace.tree().history(&NodeId::root()).unwrap().is_empty());
    }

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::parse_from(["arbor", "--offline", "--ndjson", "--model", "o3"]);
        assert!(cli.offline);
        assert!(cli.ndjson);
        assert_eq!(cli.model.as_deref(), Some("o3"));
    }
}
