//! Message text shared by the built-in senders.

use chrono::{TimeZone, Utc};
use moira_common::types::{NotificationEvent, NotificationPackage};

/// Events listed in a message body before the rest is summarised.
pub const MAX_LISTED_EVENTS: usize = 20;

/// Link to the trigger page, `None` without a configured front URI.
pub fn trigger_uri(front_uri: &str, trigger_id: &str) -> Option<String> {
    if front_uri.is_empty() || trigger_id.is_empty() {
        return None;
    }
    Some(format!("{}/trigger/{}", front_uri.trim_end_matches('/'), trigger_id))
}

/// One-line subject, e.g. `[ERROR] disk usage [db, prod] (3)`.
pub fn subject(package: &NotificationPackage) -> String {
    let state = if package.is_test() {
        "TEST".to_string()
    } else {
        package.worst_state().to_string()
    };
    let mut out = format!("[{state}] {}", package.trigger.name);
    if !package.trigger.tags.is_empty() {
        out.push_str(&format!(" [{}]", package.trigger.tags.join(", ")));
    }
    if package.events.len() > 1 {
        out.push_str(&format!(" ({})", package.events.len()));
    }
    out
}

fn format_time(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// `12:00:00 UTC: cpu.load = 95 (WARN to ERROR)`
pub fn event_line(event: &NotificationEvent) -> String {
    let mut line = format!("{}: {}", format_time(event.timestamp), event.metric);
    if let Some(value) = event.value {
        line.push_str(&format!(" = {value}"));
    }
    line.push_str(&format!(" ({} to {})", event.old_state, event.state));
    if let Some(message) = &event.message {
        line.push_str(&format!(". {message}"));
    }
    line
}

/// Plain-text body listing the package's events.
pub fn plain_body(package: &NotificationPackage, front_uri: &str) -> String {
    let mut lines = Vec::new();
    if let Some(desc) = package.trigger.desc.as_deref().filter(|d| !d.is_empty()) {
        lines.push(desc.to_string());
        lines.push(String::new());
    }
    for event in package.events.iter().take(MAX_LISTED_EVENTS) {
        lines.push(event_line(event));
    }
    if package.events.len() > MAX_LISTED_EVENTS {
        lines.push(format!(
            "...and {} more events",
            package.events.len() - MAX_LISTED_EVENTS
        ));
    }
    if let Some(uri) = trigger_uri(front_uri, &package.trigger.id) {
        lines.push(String::new());
        lines.push(uri);
    }
    if package.throttled {
        lines.push(String::new());
        lines.push("Please, fix your system or tune this trigger to generate less events.".to_string());
    }
    lines.join("\n")
}

/// Replaces `{{placeholder}}`s in a user-supplied template.
pub fn render(template: &str, package: &NotificationPackage, front_uri: &str) -> String {
    let contact = &package.contact;
    template
        .replace("{{contact_type}}", &contact.contact_type)
        .replace("{{contact_value}}", &contact.value)
        .replace("{{contact_id}}", &contact.id)
        .replace("{{trigger_id}}", &package.trigger.id)
        .replace("{{trigger_name}}", &package.trigger.name)
        .replace("{{trigger_uri}}", &trigger_uri(front_uri, &package.trigger.id).unwrap_or_default())
        .replace("{{state}}", &package.worst_state().to_string())
        .replace("{{subject}}", &subject(package))
        .replace("{{events_count}}", &package.events.len().to_string())
        .replace("{{throttled}}", if package.throttled { "true" } else { "false" })
}
