/// Hot reload: swap in a recompiled story and patch the rendered output.
///
/// Nodes are matched to the new story by their `Source` path. Nodes whose
/// story node disappeared are dropped; nodes whose text or attribute lines
/// changed are re-rendered, keeping links that were already disabled
/// disabled. Undo capture is suspended while patching so the rewrite does
/// not show up in history. Embedded text is not patched: a node is only
/// re-rendered when its own story node changed.

use rustc_hash::FxHashSet;
use serde_json::json;
use std::rc::Rc;
use tracing::{debug, info};

use crate::core::session::{RuntimeError, Session};
use crate::schema::output::{ClearedOutput, Fragment, Link, OutputNode, OutputSection};
use crate::schema::story::Story;

/// Links are recognised across a re-render by type and destination (or
/// text, for handler links).
type LinkKey = (String, String);

impl Session {
    /// Replace the story. A changed start section restarts the session;
    /// otherwise the output and history are kept and patched in place.
    pub async fn update(&mut self, story: Story) -> Result<(), RuntimeError> {
        let old = std::mem::replace(&mut self.story, Rc::new(story));
        if old.start != self.story.start {
            info!(old = %old.start, new = %self.story.start, "start section changed; restarting");
            return self.restart().await;
        }
        debug!("reconciling output with the updated story");

        self.capture_undo = false;
        let current = self.current_section.clone();

        let live = std::mem::take(&mut self.output.sections);
        self.output.sections = self.reconcile_sections(&old, live, true);

        let stack = std::mem::take(&mut self.output.clear_stack);
        let mut patched = Vec::with_capacity(stack.len());
        for cleared in stack {
            let sections = self.reconcile_sections(&old, cleared.sections, false);
            if sections.is_empty() {
                debug!("cleared output emptied by update; dropping it");
            } else {
                patched.push(ClearedOutput { sections });
            }
        }
        self.output.clear_stack = patched;
        self.output.adopt_all();

        self.current_section = current;
        if self.output.sections.is_empty() {
            self.output.restore_cleared();
        }
        let remaining = self
            .output
            .current()
            .and_then(|s| s.section.clone());
        if let Some(name) = &remaining {
            if self.current_section.as_ref() != Some(name) {
                self.current_section = Some(name.clone());
                self.set_attribute("_section", json!(name));
            }
        }
        self.capture_undo = true;

        if remaining.is_none() {
            info!("update removed every output section; starting over");
            let start = self.story.start.clone();
            self.go(&start);
        } else {
            self.save();
            self.refresh_can_go_back();
            self.update_link_states();
        }
        self.notify_load();
        self.drain_transitions().await;
        self.flush_events();
        Ok(())
    }

    fn reconcile_sections(
        &mut self,
        old: &Story,
        sections: Vec<OutputSection>,
        live: bool,
    ) -> Vec<OutputSection> {
        let story = Rc::clone(&self.story);
        let last = sections.len().saturating_sub(1);
        let mut kept = Vec::with_capacity(sections.len());

        for (index, mut section) in sections.into_iter().enumerate() {
            let name = section.section.clone().unwrap_or_default();
            if !section.placeholder && story.section(&name).is_none() {
                debug!(section = %name, "section removed from story; dropping its output");
                continue;
            }
            let editable = live && index == last;
            self.current_section = Some(name.clone());

            let content = std::mem::take(&mut section.content);
            section.content = self.reconcile_nodes(old, content, editable);

            let blocks = std::mem::take(&mut section.passages);
            for mut block in blocks {
                if !block.passage.is_empty() && story.passage(&name, &block.passage).is_none() {
                    debug!(section = %name, passage = %block.passage, "passage removed from story; dropping its output");
                    continue;
                }
                let content = std::mem::take(&mut block.content);
                block.content = self.reconcile_nodes(old, content, editable);
                section.passages.push(block);
            }
            kept.push(section);
        }
        kept
    }

    fn reconcile_nodes(&mut self, old: &Story, nodes: Vec<OutputNode>, editable: bool) -> Vec<OutputNode> {
        let story = Rc::clone(&self.story);
        let mut kept = Vec::with_capacity(nodes.len());

        for mut node in nodes {
            let Some(fresh) = story.node(&node.source) else {
                debug!(source = %node.source, "node removed from story; dropping it");
                continue;
            };
            let previous = old.node(&node.source);
            let attributes_changed = previous.map_or(true, |p| p.attributes() != fresh.attributes());
            let text_changed = previous.map_or(true, |p| p.text() != fresh.text());

            if attributes_changed {
                self.apply_attributes(fresh.attributes());
            }
            if text_changed || attributes_changed {
                debug!(source = %node.source, "re-rendering changed node");
                let disabled = disabled_links(&node.content);
                let mut content = self.process_text(fresh.text());
                restore_disabled(&mut content, &disabled, editable);
                node.content = content;
            }
            kept.push(node);
        }
        kept
    }
}

fn link_key(link: &Link) -> LinkKey {
    let target = link.destination().unwrap_or(&link.text);
    (link.kind.type_name().to_string(), target.to_string())
}

fn disabled_links(fragments: &[Fragment]) -> FxHashSet<LinkKey> {
    let mut keys = FxHashSet::default();
    collect_disabled(fragments, &mut keys);
    keys
}

fn collect_disabled(fragments: &[Fragment], keys: &mut FxHashSet<LinkKey>) {
    for fragment in fragments {
        match fragment {
            Fragment::Link(link) if link.disabled => {
                keys.insert(link_key(link));
            }
            other => {
                if let Some(children) = other.children() {
                    collect_disabled(children, keys);
                }
            }
        }
    }
}

/// Re-disable links that were disabled before the re-render. Inputs outside
/// the current section stay locked.
fn restore_disabled(fragments: &mut [Fragment], disabled: &FxHashSet<LinkKey>, editable: bool) {
    for fragment in fragments {
        match fragment {
            Fragment::Link(link) => {
                if disabled.contains(&link_key(link)) {
                    link.disabled = true;
                }
            }
            Fragment::Input(input) if !editable => input.disabled = true,
            other => {
                if let Some(children) = other.children_mut() {
                    restore_disabled(children, disabled, editable);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::story::{Passage, Section};
    use futures::executor::block_on;

    fn begin(story: Story) -> Session {
        let mut session = Session::builder()
            .story(story)
            .default_plugins(false)
            .build()
            .unwrap();
        block_on(session.begin()).unwrap();
        session
    }

    #[test]
    fn changed_text_is_re_rendered() {
        let mut session = begin(Story::new("a").with_section("a", Section::new("old text")));
        block_on(session.update(Story::new("a").with_section("a", Section::new("new text")))).unwrap();
        assert_eq!(session.output().text(), "new text");
        assert!(!session.can_go_back());
    }

    #[test]
    fn removed_passage_drops_its_block() {
        let story = |with_p: bool| {
            let mut section = Section::new("[p]");
            if with_p {
                section = section.with_passage("p", Passage::new("P shown"));
            }
            Story::new("a").with_section("a", section)
        };
        let mut session = begin(story(true));
        let id = session.output().current().unwrap().links()[0].id.unwrap();
        assert!(block_on(session.click_link(id)).unwrap());
        assert!(session.output().text().contains("P shown"));

        block_on(session.update(story(false))).unwrap();
        assert!(!session.output().text().contains("P shown"));
        assert!(session.output().current().unwrap().passages.is_empty());
    }

    #[test]
    fn changed_start_restarts() {
        let mut session = begin(
            Story::new("a")
                .with_section("a", Section::new("A").with_attributes(&["score = 3"])),
        );
        assert_eq!(session.get("score"), json!(3));
        block_on(session.update(Story::new("b").with_section("b", Section::new("B")))).unwrap();
        assert_eq!(session.output().text(), "B");
        assert!(session.get("score").is_null());
    }

    #[test]
    fn changed_attributes_are_reapplied_without_undo() {
        let mut session = begin(
            Story::new("a").with_section("a", Section::new("{{score}}").with_attributes(&["score = 1"])),
        );
        block_on(session.update(
            Story::new("a").with_section("a", Section::new("{{score}}").with_attributes(&["score = 5"])),
        ))
        .unwrap();
        assert_eq!(session.output().text(), "5");
        assert!(session.output().current().unwrap().undo.get("score").is_some());
        assert!(session.undo.is_empty());
    }
}
