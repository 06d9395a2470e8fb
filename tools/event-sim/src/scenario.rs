//! Event lists to send: the built-in simulation or a JSON file

use std::path::Path;

use anyhow::Context;
use event_dispatch::OutboundEvent;
use serde_json::json;

pub const USER_A_ID: i64 = 999999901;
/// Acts as the sample's creator
pub const USER_B_ID: i64 = 999999902;
pub const SAMPLE_ID: i64 = 999999901;

/// Full sample lifecycle with every interaction type in between
pub fn lifecycle_simulation() -> Vec<OutboundEvent> {
    let raw = [
        (
            "sample.lifecycle.created",
            json!({
                "sample_id": SAMPLE_ID,
                "creator_id": USER_B_ID,
                "metadata": {"tags": ["rust", "test"], "bpm": 125}
            }),
        ),
        (
            "sample.lifecycle.updated",
            json!({
                "sample_id": SAMPLE_ID,
                "creator_id": USER_B_ID,
                "metadata": {"tags": ["rust", "updated"], "bpm": 130}
            }),
        ),
        (
            "user.interaction.like",
            json!({"user_id": USER_A_ID, "sample_id": SAMPLE_ID}),
        ),
        (
            "user.interaction.unlike",
            json!({"user_id": USER_A_ID, "sample_id": SAMPLE_ID}),
        ),
        (
            "user.interaction.comment",
            json!({"user_id": USER_A_ID, "sample_id": SAMPLE_ID}),
        ),
        (
            "user.interaction.follow",
            json!({"user_id": USER_A_ID, "followed_user_id": USER_B_ID}),
        ),
        (
            "user.interaction.unfollow",
            json!({"user_id": USER_A_ID, "unfollowed_user_id": USER_B_ID}),
        ),
        ("sample.lifecycle.deleted", json!({"sample_id": SAMPLE_ID})),
    ];

    raw.into_iter()
        .filter_map(|(name, payload)| OutboundEvent::new(name, payload).ok())
        .collect()
}

/// Load a JSON array of `{"event_name": ..., "payload": {...}}`
///
/// Entries are not validated here; an empty `event_name` fails its own slot
/// at dispatch time.
pub fn load(path: &Path) -> anyhow::Result<Vec<OutboundEvent>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading events file {}", path.display()))?;

    OutboundEvent::list_from_json(&bytes)
        .with_context(|| format!("parsing events file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_has_eight_events_in_order() {
        let events = lifecycle_simulation();

        assert_eq!(events.len(), 8);
        assert_eq!(events[0].event_name, "sample.lifecycle.created");
        assert_eq!(events[7].event_name, "sample.lifecycle.deleted");
        assert_eq!(events[5].payload["followed_user_id"], USER_B_ID);
    }

    #[test]
    fn test_bundled_events_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("events/interactions.json");
        let events = load(&path).unwrap();

        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.event_name.starts_with("user.interaction.")));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load(Path::new("/nonexistent/events.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/events.json"));
    }
}
