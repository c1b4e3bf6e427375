//! The server's event channels.
//!
//! Each channel is a notification method scoped by one key. Subscribing
//! sends `subscribe` with `{method, scope: {<key>: <value>}}`.

use std::fmt;

use serde_json::{Value, json};

/// A server-pushed event channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Container output of a workspace's machines.
    RuntimeLog,
    /// Machine lifecycle transitions.
    MachineStatus,
    /// Output of agent installers.
    InstallerLog,
    /// Workspace lifecycle transitions.
    WorkspaceStatus,
    /// Organization created, renamed or removed.
    OrganizationStatus,
    /// A user's organization membership changed.
    OrganizationMembership,
}

impl Channel {
    /// Every channel.
    pub const ALL: [Self; 6] = [
        Self::RuntimeLog,
        Self::MachineStatus,
        Self::InstallerLog,
        Self::WorkspaceStatus,
        Self::OrganizationStatus,
        Self::OrganizationMembership,
    ];

    /// Notification method name.
    pub fn method(self) -> &'static str {
        match self {
            Self::RuntimeLog => "runtime/log",
            Self::MachineStatus => "machine/statusChanged",
            Self::InstallerLog => "installer/log",
            Self::WorkspaceStatus => "workspace/statusChanged",
            Self::OrganizationStatus => "organization/statusChanged",
            Self::OrganizationMembership => "organization/membershipChanged",
        }
    }

    /// Name of the scope parameter.
    pub fn scope_key(self) -> &'static str {
        match self {
            Self::RuntimeLog | Self::MachineStatus | Self::InstallerLog | Self::WorkspaceStatus => {
                "workspaceId"
            }
            Self::OrganizationStatus => "organizationId",
            Self::OrganizationMembership => "userId",
        }
    }

    /// Reverse of [`Self::method`].
    pub fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.method() == method)
    }

    /// Params of the `subscribe`/`unsubscribe` request for `scope_value`.
    pub fn scope_params(self, scope_value: &str) -> Value {
        json!({
            "method": self.method(),
            "scope": { self.scope_key(): scope_value },
        })
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}
