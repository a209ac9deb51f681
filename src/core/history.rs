/// Undo logs and `go_back`.
///
/// Each render step records the value every attribute had before the step
/// first changed it. The log is attached to the output section or passage block
/// the step produced; `go_back` removes that node and writes the old values
/// back silently.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::core::session::Session;
use crate::core::state::StateStore;
use crate::schema::output::{Fragment, LinkKind};

/// Attribute name to value-before-the-step. `Null` means "did not exist".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UndoLog(BTreeMap<String, Value>);

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `previous` unless this attribute already changed in the step.
    pub fn record(&mut self, attribute: &str, previous: Value) {
        self.0.entry(attribute.to_string()).or_insert(previous);
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.0.get(attribute)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn take(&mut self) -> UndoLog {
        std::mem::take(self)
    }

    /// Write the captured values back without notifying anyone.
    pub fn apply(&self, state: &mut StateStore) {
        for (attribute, value) in &self.0 {
            state.restore(attribute, value.clone());
        }
    }
}

/// Attributes that are bookkeeping for the output itself and never undone.
pub(crate) const UNTRACKED: [&str; 3] = ["_output", "_section-count", "_transition"];

impl Session {
    /// Whether there is anything to go back to.
    pub fn can_go_back(&self) -> bool {
        self.output.history_depth() > 1
    }

    /// Undo the most recent passage, or if there is none, the most recent
    /// section. Does nothing at the start of history.
    pub fn go_back(&mut self) {
        if !self.can_go_back() {
            return;
        }
        let passage_block = self
            .output
            .current_mut()
            .and_then(|section| section.passages.pop());

        match passage_block {
            Some(block) => {
                debug!(passage = %block.passage, "going back over passage");
                block.undo.apply(&mut self.state);
                if block.clears {
                    if self
                        .output
                        .current()
                        .is_some_and(|s| s.placeholder && s.passages.is_empty())
                    {
                        self.output.sections.pop();
                    }
                    self.output.restore_cleared();
                }
                self.reenable_links(|kind| {
                    matches!(kind, LinkKind::Passage { target } if destination(target) == block.passage)
                });
            }
            None => {
                let Some(section) = self.output.sections.pop() else {
                    return;
                };
                debug!(section = ?section.section, "going back over section");
                section.undo.apply(&mut self.state);
                if section.clears {
                    self.output.restore_cleared();
                }
                if let Some(name) = section.section {
                    self.reenable_links(|kind| {
                        matches!(kind, LinkKind::Section { target } if destination(target) == name)
                    });
                }
            }
        }

        self.current_section = self
            .state
            .get("_section")
            .as_str()
            .map(str::to_string);
        self.save();
        self.refresh_can_go_back();
        self.update_link_states();
        self.flush_events();
    }

    /// Re-enable links in the now-current section that match `matches`.
    fn reenable_links(&mut self, matches: impl Fn(&LinkKind) -> bool) {
        if let Some(section) = self.output.current_mut() {
            section.for_each_fragment_mut(&mut |fragment| {
                if let Fragment::Link(link) = fragment {
                    if matches(&link.kind) {
                        link.disabled = false;
                    }
                }
            });
        }
    }

    /// Attach the step's undo log to the node it produced and start a new one.
    pub(crate) fn flush_undo(&mut self, into_passage: bool) {
        let log = self.undo.take();
        let Some(section) = self.output.current_mut() else {
            return;
        };
        if into_passage {
            if let Some(block) = section.passages.last_mut() {
                merge(&mut block.undo, log);
            }
        } else {
            merge(&mut section.undo, log);
        }
    }

    /// Emit `CanGoBackChanged` if reachability flipped.
    pub(crate) fn refresh_can_go_back(&mut self) {
        let now = self.can_go_back();
        if now != self.can_go_back_cached {
            self.can_go_back_cached = now;
            self.emit(crate::schema::event::SessionEvent::CanGoBackChanged { can_go_back: now });
        }
    }
}

fn destination(target: &str) -> &str {
    target.split(',').next().map(str::trim).unwrap_or("")
}

/// Entries already in `into` are older and win.
fn merge(into: &mut UndoLog, log: UndoLog) {
    for (attribute, value) in log.0 {
        into.record(&attribute, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_change_wins() {
        let mut log = UndoLog::new();
        log.record("x", Value::Null);
        log.record("x", json!(5));
        assert_eq!(log.get("x"), Some(&Value::Null));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn apply_restores_and_removes() {
        let mut state = StateStore::new();
        state.set("x", json!(2));
        state.set("y", json!("new"));
        let mut log = UndoLog::new();
        log.record("x", json!(1));
        log.record("y", Value::Null);
        log.apply(&mut state);
        assert_eq!(state.get("x"), json!(1));
        assert!(!state.contains("y"));
    }

    #[test]
    fn merge_keeps_older_entries() {
        let mut older = UndoLog::new();
        older.record("x", json!(1));
        let mut newer = UndoLog::new();
        newer.record("x", json!(2));
        newer.record("y", json!(3));
        merge(&mut older, newer);
        assert_eq!(older.get("x"), Some(&json!(1)));
        assert_eq!(older.get("y"), Some(&json!(3)));
    }

    #[test]
    fn serializes_as_plain_map() {
        let mut log = UndoLog::new();
        log.record("score", json!(0));
        assert_eq!(serde_json::to_string(&log).unwrap(), r#"{"score":0}"#);
    }
}
