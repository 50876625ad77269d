//! Display view that collapses consecutive cumulative snapshots.
//!
//! The agent re-emits the whole assistant message as it grows, so a run of
//! same-typed entries is one logical message. Only the latest of each run is
//! shown. `stderr` and `raw` lines are independent and always kept.

use crate::models::LogEntry;

/// Collapse runs of consecutive entries that share a collapsible type,
/// keeping the last of each run.
pub fn dedup_view<'a, I>(entries: I) -> Vec<LogEntry>
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut view: Vec<LogEntry> = Vec::new();
    for entry in entries {
        if let Some(last) = view.last_mut()
            && last.message_type == entry.message_type
            && entry.message_type.collapses()
        {
            *last = entry.clone();
        } else {
            view.push(entry.clone());
        }
    }
    view
}
