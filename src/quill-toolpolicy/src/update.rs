//! Dynamic policy updates and persistence.
//!
//! When the user answers an approval prompt with "always allow", the
//! session emits a [`PolicyUpdateEvent`]. The updater inserts the matching
//! rules into the live engine immediately and, when asked to, appends
//! them to the user's auto-saved policy file so they survive restarts.
//!
//! Writes go through a single worker fed by an unbounded channel, so
//! concurrent grants serialize instead of clobbering each other. Each
//! write lands in a uniquely named temp file first and is renamed over
//! the target, so a crash mid-write never leaves a truncated file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::assembler::{RUNTIME_GRANT_RAW_PRIORITY, priorities};
use crate::decision::PolicyDecision;
use crate::engine::PolicyEngine;
use crate::error::PolicyError;
use crate::pattern::{compile_pattern, prefix_to_pattern};
use crate::rule::{MCP_TOOL_SEPARATOR, PolicyRule, RuleSource, SHELL_TOOL_NAME};

/// A runtime "always allow" grant.
#[derive(Debug, Clone)]
pub struct PolicyUpdateEvent {
    /// Tool the grant applies to; `None` with `mcp_name` set grants the
    /// whole server.
    pub tool_name: Option<String>,
    /// MCP server name, combined with `tool_name` as in rule files.
    pub mcp_name: Option<String>,
    /// Shell command prefixes to allow. Only meaningful for the shell
    /// tool.
    pub command_prefix: Option<Vec<String>>,
    /// Raw regex over the canonical argument string.
    pub args_pattern: Option<String>,
    /// Whether to append the grant to the auto-saved policy file.
    pub persist: bool,
}

impl PolicyUpdateEvent {
    /// Grant a set of shell command prefixes.
    pub fn shell_prefixes(prefixes: Vec<String>, persist: bool) -> Self {
        Self {
            tool_name: Some(SHELL_TOOL_NAME.to_string()),
            mcp_name: None,
            command_prefix: Some(prefixes),
            args_pattern: None,
            persist,
        }
    }

    /// Grant a whole tool, regardless of arguments.
    pub fn tool(tool_name: impl Into<String>, persist: bool) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            mcp_name: None,
            command_prefix: None,
            args_pattern: None,
            persist,
        }
    }
}

enum WriteJob {
    Grant(PersistedGrant),
    Flush(oneshot::Sender<()>),
}

/// One grant as it is appended to the auto-saved file.
#[derive(Debug, Clone)]
struct PersistedGrant {
    tool_name: String,
    command_prefix: Option<Vec<String>>,
    args_pattern: Option<String>,
}

/// Applies [`PolicyUpdateEvent`]s to a live engine and persists them.
pub struct PolicyUpdater {
    engine: Arc<PolicyEngine>,
    jobs: mpsc::UnboundedSender<WriteJob>,
}

impl PolicyUpdater {
    /// Create an updater writing grants to `store_path`.
    ///
    /// Spawns the write worker; it exits when the updater is dropped and
    /// the queue drains.
    pub fn new(engine: Arc<PolicyEngine>, store_path: PathBuf) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    WriteJob::Grant(grant) => {
                        if let Err(err) = append_grant(&store_path, &grant).await {
                            warn!(
                                path = %store_path.display(),
                                %err,
                                "failed to persist policy grant",
                            );
                        }
                    }
                    WriteJob::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { engine, jobs }
    }

    /// Consume grant events from a session broadcast channel until it
    /// closes.
    pub fn subscribe(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PolicyUpdateEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.apply(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "policy update stream lagged, grants were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Apply one grant: insert the matching rules into the live engine
    /// and enqueue persistence if requested.
    ///
    /// A grant with an unusable pattern is skipped with a warning; it
    /// never poisons the engine.
    pub fn apply(&self, event: &PolicyUpdateEvent) {
        let tool_name = match (&event.tool_name, &event.mcp_name) {
            (Some(tool), Some(mcp)) => Some(format!("{mcp}{MCP_TOOL_SEPARATOR}{tool}")),
            (None, Some(mcp)) => Some(format!("{mcp}{MCP_TOOL_SEPARATOR}*")),
            (Some(tool), None) => Some(tool.clone()),
            (None, None) => None,
        };
        let Some(tool_name) = tool_name else {
            warn!("policy grant without a tool name, ignoring");
            return;
        };

        // `None` in the list means match-any-args.
        let patterns: Vec<Option<String>> = match (&event.command_prefix, &event.args_pattern) {
            (Some(prefixes), _) => prefixes
                .iter()
                .map(|prefix| Some(prefix_to_pattern(prefix)))
                .collect(),
            (None, Some(pattern)) => vec![Some(pattern.clone())],
            (None, None) => vec![None],
        };

        let mut inserted = 0usize;
        for pattern in &patterns {
            let args_pattern = match pattern {
                None => None,
                Some(raw) => match compile_pattern(raw) {
                    Ok(compiled) => Some(compiled),
                    Err(err) => {
                        warn!(pattern = %raw, %err, "skipping unusable policy grant pattern");
                        continue;
                    }
                },
            };
            self.engine.add_rule(PolicyRule {
                tool_name: Some(tool_name.clone()),
                args_pattern,
                decision: PolicyDecision::Allow,
                priority: priorities::RUNTIME_GRANT,
                modes: None,
                allow_redirection: false,
                source: RuleSource::RuntimeGrant,
                deny_message: None,
            });
            inserted += 1;
        }
        debug!(tool = %tool_name, rules = inserted, "applied policy grant");

        if event.persist && inserted > 0 {
            let grant = PersistedGrant {
                tool_name,
                command_prefix: event.command_prefix.clone(),
                args_pattern: event.args_pattern.clone(),
            };
            if self.jobs.send(WriteJob::Grant(grant)).is_err() {
                warn!("policy write worker is gone, grant not persisted");
            }
        }
    }

    /// Wait until every grant enqueued so far has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(WriteJob::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The auto-saved policy file, in the same schema the loader reads.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedPolicyFile {
    #[serde(default)]
    rule: Vec<SavedRuleEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedRuleEntry {
    tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command_prefix: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args_pattern: Option<String>,
    decision: PolicyDecision,
    priority: i64,
}

impl SavedRuleEntry {
    fn from_grant(grant: &PersistedGrant) -> Self {
        // The prefix shorthand is only legal for the shell tool, so
        // grants for other tools are stored as anchored patterns.
        let (command_prefix, args_pattern) = if grant.tool_name == SHELL_TOOL_NAME {
            (grant.command_prefix.clone(), grant.args_pattern.clone())
        } else {
            match &grant.command_prefix {
                Some(prefixes) => {
                    let joined = prefixes
                        .iter()
                        .map(|prefix| prefix_to_pattern(prefix))
                        .collect::<Vec<_>>()
                        .join("|");
                    (None, Some(joined))
                }
                None => (None, grant.args_pattern.clone()),
            }
        };
        Self {
            tool_name: grant.tool_name.clone(),
            command_prefix,
            args_pattern,
            decision: PolicyDecision::Allow,
            priority: RUNTIME_GRANT_RAW_PRIORITY,
        }
    }
}

async fn append_grant(path: &Path, grant: &PersistedGrant) -> Result<(), PolicyError> {
    let mut saved = match tokio::fs::read_to_string(path).await {
        Ok(content) => match toml::from_str::<SavedPolicyFile>(&content) {
            Ok(saved) => saved,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    %err,
                    "auto-saved policy file is corrupt, starting fresh",
                );
                SavedPolicyFile::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => SavedPolicyFile::default(),
        Err(err) => return Err(err.into()),
    };

    saved.rule.push(SavedRuleEntry::from_grant(grant));
    let serialized = toml::to_string_pretty(&saved)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Unique temp name so concurrent writers never share a scratch file;
    // the rename makes the replacement atomic.
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .await?;
    file.write_all(serialized.as_bytes()).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temp_path, path).await?;

    debug!(path = %path.display(), "persisted policy grant");
    Ok(())
}
