//! Typed payloads of the event channels.
//!
//! Servers add fields over time, so every payload keeps unknown members in
//! `extra` and every field the client does not strictly need is optional.

use std::fmt;
use std::str::FromStr;

use che_core::ids::{OrganizationId, UserId, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Workspace lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    /// Up and serving.
    Running,
    /// Not running.
    Stopped,
    /// Suspended.
    Paused,
    /// Booting.
    Starting,
    /// Shutting down.
    Stopping,
    /// Failed to start or crashed.
    Error,
    /// A status this client does not know.
    #[serde(other)]
    Unknown,
}

impl WorkspaceStatus {
    /// Every status the server is known to send.
    pub const KNOWN: [Self; 6] = [
        Self::Running,
        Self::Stopped,
        Self::Paused,
        Self::Starting,
        Self::Stopping,
        Self::Error,
    ];

    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Paused => "PAUSED",
            Self::Starting => "STARTING",
            Self::Stopping => "STOPPING",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status name outside [`WorkspaceStatus::KNOWN`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown workspace status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for WorkspaceStatus {
    type Err = UnknownStatus;

    /// Case-insensitive wire spelling. `UNKNOWN` itself is not accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::KNOWN
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStatus(s.to_owned()))
    }
}

/// `workspace/statusChanged`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatusEvent {
    /// Workspace the transition belongs to.
    pub workspace_id: WorkspaceId,
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkspaceStatus>,
    /// Previous status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_status: Option<WorkspaceStatus>,
    /// Whether the transition is intermediate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitional: Option<bool>,
    /// Failure description, present when the transition failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Members not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkspaceStatusEvent {
    /// The status this event puts the workspace in. A message carrying an
    /// error counts as [`WorkspaceStatus::Error`] whatever its `status` says.
    pub fn effective_status(&self) -> Option<WorkspaceStatus> {
        if self.error.is_some() {
            Some(WorkspaceStatus::Error)
        } else {
            self.status
        }
    }
}

/// Who a machine belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineIdentity {
    /// Owning workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<WorkspaceId>,
    /// Environment the machine was started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    /// Owner of the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
}

/// `machine/statusChanged`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatusEvent {
    /// `CREATING`, `RUNNING`, `DESTROYED`, `ERROR`...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Machine the event is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    /// Ownership details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<MachineIdentity>,
    /// Owning workspace, when sent flat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<WorkspaceId>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Members not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MachineStatusEvent {
    /// Owning workspace from either spelling.
    pub fn workspace(&self) -> Option<&WorkspaceId> {
        self.workspace_id
            .as_ref()
            .or_else(|| self.identity.as_ref()?.workspace_id.as_ref())
    }
}

/// Identifies a workspace runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeIdentity {
    /// Workspace of the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<WorkspaceId>,
    /// Environment name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    /// Owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
}

/// One line of output, shared by `runtime/log` and `installer/log`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Runtime that produced the line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<RuntimeIdentity>,
    /// Machine that produced the line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    /// The text.
    #[serde(default)]
    pub text: String,
    /// Server timestamp, as sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// `STDOUT` or `STDERR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// Installer id, for installer output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer: Option<String>,
    /// Members not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogEvent {
    /// Workspace of the producing runtime.
    pub fn workspace(&self) -> Option<&WorkspaceId> {
        self.runtime_id.as_ref()?.workspace_id.as_ref()
    }
}

/// `runtime/log`.
pub type RuntimeLogEvent = LogEvent;

/// `installer/log`.
pub type InstallerLogEvent = LogEvent;

/// Organization summary carried by organization events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationRef {
    /// Organization id.
    pub id: OrganizationId,
    /// Short name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Full path including parents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualified_name: Option<String>,
}

/// `organization/statusChanged`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationEvent {
    /// `RENAMED`, `REMOVED`...
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// The organization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<OrganizationRef>,
    /// User who caused the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    /// Members not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `organization/membershipChanged`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEvent {
    /// `MEMBER_ADDED`, `MEMBER_REMOVED`...
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Organization the membership belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<OrganizationRef>,
    /// Affected member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<UserId>,
    /// User who caused the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    /// Members not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workspace_status_parses() {
        let ev: WorkspaceStatusEvent = serde_json::from_value(json!({
            "workspaceId": "w1",
            "status": "RUNNING",
            "prevStatus": "STARTING",
            "transitional": false,
            "serverTime": 17,
        }))
        .unwrap();
        assert_eq!(ev.workspace_id.as_str(), "w1");
        assert_eq!(ev.status, Some(WorkspaceStatus::Running));
        assert_eq!(ev.prev_status, Some(WorkspaceStatus::Starting));
        assert_eq!(ev.extra["serverTime"], 17);
        assert_eq!(ev.effective_status(), Some(WorkspaceStatus::Running));
    }

    #[test]
    fn error_overrides_status() {
        let ev: WorkspaceStatusEvent = serde_json::from_value(json!({
            "workspaceId": "w1",
            "status": "STOPPED",
            "error": "out of memory",
        }))
        .unwrap();
        assert_eq!(ev.effective_status(), Some(WorkspaceStatus::Error));
    }

    #[test]
    fn status_parses_from_wire_spelling() {
        for status in WorkspaceStatus::KNOWN {
            assert_eq!(status.as_str().parse::<WorkspaceStatus>(), Ok(status));
        }
        assert_eq!("running".parse(), Ok(WorkspaceStatus::Running));
        assert_eq!(
            "unknown".parse::<WorkspaceStatus>(),
            Err(UnknownStatus("unknown".into()))
        );
        assert_eq!(
            "SLEEPING".parse::<WorkspaceStatus>().unwrap_err().to_string(),
            "unknown workspace status: SLEEPING"
        );
    }

    #[test]
    fn unknown_status_tolerated() {
        let ev: WorkspaceStatusEvent =
            serde_json::from_value(json!({"workspaceId": "w1", "status": "SNAPSHOTTING"})).unwrap();
        assert_eq!(ev.status, Some(WorkspaceStatus::Unknown));
    }

    #[test]
    fn machine_status_workspace_from_identity() {
        let ev: MachineStatusEvent = serde_json::from_value(json!({
            "eventType": "RUNNING",
            "machineName": "dev-machine",
            "identity": {"workspaceId": "w2", "envName": "default", "ownerId": "u1"},
        }))
        .unwrap();
        assert_eq!(ev.workspace().map(WorkspaceId::as_str), Some("w2"));
        assert_eq!(ev.machine_name.as_deref(), Some("dev-machine"));
    }

    #[test]
    fn log_event_parses() {
        let ev: LogEvent = serde_json::from_value(json!({
            "runtimeId": {"workspaceId": "w3", "envName": "default", "ownerId": "u1"},
            "machineName": "db",
            "text": "listening on 5432",
            "time": "2017-08-01T10:00:00Z",
            "stream": "STDOUT",
        }))
        .unwrap();
        assert_eq!(ev.workspace().map(WorkspaceId::as_str), Some("w3"));
        assert_eq!(ev.text, "listening on 5432");
        assert!(ev.installer.is_none());
    }

    #[test]
    fn organization_event_type_field() {
        let ev: OrganizationEvent = serde_json::from_value(json!({
            "type": "RENAMED",
            "organization": {"id": "o1", "name": "new", "qualifiedName": "parent/new"},
            "initiator": "admin",
        }))
        .unwrap();
        assert_eq!(ev.event_type.as_deref(), Some("RENAMED"));
        assert_eq!(ev.organization.unwrap().qualified_name.as_deref(), Some("parent/new"));
    }

    #[test]
    fn membership_event_parses() {
        let ev: MembershipEvent = serde_json::from_value(json!({
            "type": "MEMBER_ADDED",
            "organization": {"id": "o1"},
            "member": "u5",
        }))
        .unwrap();
        assert_eq!(ev.member.as_ref().map(UserId::as_str), Some("u5"));
    }
}
