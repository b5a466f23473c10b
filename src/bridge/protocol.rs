//! Wire types for the control-plane channel.

use serde::{Deserialize, Serialize};

/// Inbound command from the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Prompt(PromptCommand),
    Push {
        #[serde(rename = "pushSpec")]
        push_spec: PushSpec,
    },
    Shutdown,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Prompt(_) => "prompt",
            Command::Push { .. } => "push",
            Command::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptCommand {
    pub message_id: String,
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub author: Author,
}

/// The user a prompt was issued on behalf of.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scm_name: Option<String>,
    #[serde(default)]
    pub scm_email: Option<String>,
}

/// Where and how to push.
///
/// `remote_url` embeds credentials and is only ever handed to git;
/// `redacted_remote_url` is what gets logged.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSpec {
    pub target_branch: String,
    pub refspec: String,
    pub remote_url: String,
    pub redacted_remote_url: String,
    #[serde(default)]
    pub force: bool,
}

impl std::fmt::Debug for PushSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSpec")
            .field("target_branch", &self.target_branch)
            .field("refspec", &self.refspec)
            .field("remote_url", &self.redacted_remote_url)
            .field("force", &self.force)
            .finish()
    }
}

/// Outbound event to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Ready {
        #[serde(rename = "sandboxId")]
        sandbox_id: String,
    },
    Heartbeat {
        #[serde(rename = "sandboxId")]
        sandbox_id: String,
        timestamp: i64,
    },
    AgentEvent {
        #[serde(rename = "messageId")]
        message_id: String,
        data: serde_json::Value,
    },
    Error {
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        error: String,
    },
    ExecutionComplete {
        #[serde(rename = "messageId")]
        message_id: String,
        success: bool,
    },
    PushComplete {
        #[serde(rename = "branchName")]
        branch_name: String,
    },
    PushError {
        error: String,
        #[serde(rename = "branchName")]
        branch_name: String,
    },
}
