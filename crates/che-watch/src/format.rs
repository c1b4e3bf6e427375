//! One-line renderings of channel events.

use che_session::events::{
    LogEvent, MachineStatusEvent, MembershipEvent, OrganizationEvent, WorkspaceStatusEvent,
};

const UNKNOWN: &str = "?";

pub fn workspace_status(event: &WorkspaceStatusEvent) -> String {
    let status = event.effective_status().map_or(UNKNOWN, |s| s.as_str());
    let mut line = match event.prev_status {
        Some(prev) => format!("[{}] status {prev} -> {status}", event.workspace_id),
        None => format!("[{}] status {status}", event.workspace_id),
    };
    if let Some(error) = &event.error {
        line.push_str(": ");
        line.push_str(error);
    }
    line
}

pub fn machine_status(event: &MachineStatusEvent) -> String {
    let workspace = event.workspace().map_or(UNKNOWN, |w| w.as_str());
    let machine = event.machine_name.as_deref().unwrap_or(UNKNOWN);
    let kind = event.event_type.as_deref().unwrap_or(UNKNOWN);
    match &event.error {
        Some(error) => format!("[{workspace}] machine {machine} {kind}: {error}"),
        None => format!("[{workspace}] machine {machine} {kind}"),
    }
}

/// `source` is `runtime` or `installer`.
pub fn log_line(source: &str, event: &LogEvent) -> String {
    let workspace = event.workspace().map_or(UNKNOWN, |w| w.as_str());
    let origin = event
        .installer
        .as_deref()
        .or(event.machine_name.as_deref())
        .unwrap_or(UNKNOWN);
    format!("[{workspace}] {source} {origin} | {}", event.text.trim_end())
}

pub fn organization(event: &OrganizationEvent) -> String {
    let kind = event.event_type.as_deref().unwrap_or(UNKNOWN);
    match &event.organization {
        Some(org) => {
            let name = org
                .qualified_name
                .as_deref()
                .or(org.name.as_deref())
                .unwrap_or(org.id.as_str());
            format!("[org {}] {kind} {name}", org.id)
        }
        None => format!("[org] {kind}"),
    }
}

pub fn membership(event: &MembershipEvent) -> String {
    let kind = event.event_type.as_deref().unwrap_or(UNKNOWN);
    let org = event.organization.as_ref().map_or(UNKNOWN, |o| o.id.as_str());
    let member = event.member.as_ref().map_or(UNKNOWN, |m| m.as_str());
    format!("[org {org}] {kind} {member}")
}
