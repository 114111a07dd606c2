//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Canonical channel name builders."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
//! The only sanctioned way to name bus channels.

const CANVAS_PREFIX: &str = "canvas:";
const USER_PREFIX: &str = "user:";
const BROADCAST: &str = "broadcast:all";
const SYSTEM_EVENTS: &str = "system:events";

/// Channel carrying collaboration traffic for one canvas.
pub fn canvas_channel(canvas_id: &str) -> String {
    format!("{CANVAS_PREFIX}{canvas_id}")
}

/// Channel carrying notifications addressed to one user.
pub fn user_channel(user_id: &str) -> String {
    format!("{USER_PREFIX}{user_id}")
}

/// Channel every server instance listens on.
pub fn broadcast_channel() -> String {
    BROADCAST.to_owned()
}

/// Channel for platform lifecycle and system events.
pub fn system_events_channel() -> String {
    SYSTEM_EVENTS.to_owned()
}

/// Pattern matching every canvas channel.
pub fn all_canvases_pattern() -> String {
    format!("{CANVAS_PREFIX}*")
}

/// Pattern matching every user channel.
pub fn all_users_pattern() -> String {
    format!("{USER_PREFIX}*")
}
