use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Names of the events a session publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    LinkClick,
    Set,
    CanGoBackChanged,
}

impl EventKind {
    /// Returns the name hosts subscribe with (e.g., "linkClick").
    pub fn name(&self) -> &'static str {
        match self {
            Self::LinkClick => "linkClick",
            Self::Set => "set",
            Self::CanGoBackChanged => "canGoBackChanged",
        }
    }
}

/// Something that happened in a session. Delivered to subscribers after the
/// public call that caused it has finished its synchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A story link was clicked. `link_type` is `section`, `passage` or the
    /// link handler's name.
    LinkClick { link_type: String },
    /// An attribute was set.
    Set { attribute: String, value: Value },
    /// `can_go_back` flipped.
    CanGoBackChanged { can_go_back: bool },
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LinkClick { .. } => EventKind::LinkClick,
            Self::Set { .. } => EventKind::Set,
            Self::CanGoBackChanged { .. } => EventKind::CanGoBackChanged,
        }
    }
}
