/// The navigation engine: `begin`, `restart`, `go`, passage display and link
/// clicks.
///
/// A navigation step renders into the output tree, then captures undo, saves
/// the output, refreshes `can_go_back`, drains transitions and finally
/// delivers queued events, always in that order.

use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{debug, error, warn};

use crate::core::animation::{Transition, TransitionDescriptor};
use crate::core::helpers::HelperCall;
use crate::core::history::UndoLog;
use crate::core::plugin::PluginHost;
use crate::core::session::{RuntimeError, Session};
use crate::core::value::{number, to_number};
use crate::schema::event::SessionEvent;
use crate::schema::output::{ElementId, Fragment, Link, LinkKind, Output, OutputNode, OutputSection, Source};
use crate::schema::story::StoryNode;

/// Scripts redirecting to scripts that redirect again stop after this many hops.
const MAX_REDIRECTS: usize = 32;

/// What a story script callback can see and do.
pub struct ScriptContext<'a> {
    session: &'a mut Session,
}

impl ScriptContext<'_> {
    pub fn get(&self, attribute: &str) -> Value {
        self.session.state.get(attribute)
    }

    /// Set an attribute. `None` stores `true`.
    pub fn set(&mut self, attribute: &str, value: impl Into<Option<Value>>) {
        let value = value.into().unwrap_or(Value::Bool(true));
        self.session.set_attribute(attribute, value);
    }

    pub fn seen(&self, name: &str) -> bool {
        self.session.state.seen(name)
    }

    pub fn current_section_name(&self) -> Option<&str> {
        self.session.current_section.as_deref()
    }

    /// Navigate to `section` once the running section's script returns.
    /// The section being run then does not write its own text.
    pub fn go(&mut self, section: &str) {
        self.session.pending_redirect = Some(section.to_string());
    }

    pub fn add_transition(&mut self, transition: Transition) {
        self.session.add_transition(transition);
    }
}

impl Session {
    /// Start the story, or resume the saved output if there is one.
    pub async fn begin(&mut self) -> Result<(), RuntimeError> {
        self.state.load()?;
        if let Some(index) = self.story.ui_script_index {
            self.run_script(index);
        }
        if !self.load()? {
            let start = self.story.start.clone();
            self.go(&start);
        }
        self.drain_transitions().await;
        self.flush_events();
        Ok(())
    }

    /// Forget all attributes and output and begin again.
    pub async fn restart(&mut self) -> Result<(), RuntimeError> {
        debug!("restarting story");
        self.state.reset();
        self.output = Output::new();
        self.undo = UndoLog::new();
        self.current_section = None;
        self.pending_redirect = None;
        self.writing_passage = false;
        self.reset_transitions();
        self.refresh_can_go_back();
        self.begin().await
    }

    /// Restore the output saved in `_output`. Returns whether there was one.
    fn load(&mut self) -> Result<bool, RuntimeError> {
        let saved = self.state.get("_output");
        if saved.is_null() {
            return Ok(false);
        }
        let output: Output = serde_json::from_value(saved)?;
        if output.is_empty() {
            return Ok(false);
        }
        debug!(sections = output.sections.len(), "restoring saved output");
        self.output = output;
        self.current_section = self.state.get("_section").as_str().map(str::to_string);
        self.can_go_back_cached = self.can_go_back();
        self.notify_load();

        let transition = self.state.get("_transition");
        if !transition.is_null() {
            match serde_json::from_value::<TransitionDescriptor>(transition) {
                Ok(descriptor) => self.replay_transition(&descriptor),
                Err(err) => warn!(%err, "saved transition could not be read"),
            }
        }
        self.update_link_states();
        Ok(true)
    }

    fn replay_transition(&mut self, descriptor: &TransitionDescriptor) {
        let Some(helper) = self.helpers.get(&descriptor.helper) else {
            warn!(helper = %descriptor.helper, "no helper to replay saved transition");
            return;
        };
        debug!(helper = %descriptor.helper, "replaying saved transition");
        let call = HelperCall {
            name: &descriptor.helper,
            args: descriptor.args.clone(),
            hash: descriptor.hash.clone(),
            body: None,
            body_source: None,
        };
        let result = {
            let mut host = PluginHost::new(self);
            catch_unwind(AssertUnwindSafe(|| helper(&mut host, &call)))
        };
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(helper = %descriptor.helper, %err, "replayed transition failed"),
            Err(_) => error!(helper = %descriptor.helper, "replayed transition panicked"),
        }
    }

    /// Navigate to a section. Unknown sections are ignored. Returns whether
    /// any section was entered.
    pub(crate) fn go(&mut self, section: &str) -> bool {
        let mut target = section.to_string();
        let mut entered = false;
        for _ in 0..MAX_REDIRECTS {
            if !self.enter_section(&target) {
                return entered;
            }
            entered = true;
            match self.pending_redirect.take() {
                Some(next) => target = next,
                None => return true,
            }
        }
        warn!(section = %target, "too many script redirects; stopping");
        self.pending_redirect = None;
        entered
    }

    fn enter_section(&mut self, name: &str) -> bool {
        let story = Rc::clone(&self.story);
        let Some(section) = story.section(name) else {
            warn!(section = name, "no section with this name");
            self.pending_redirect = None;
            return false;
        };
        debug!(section = name, "entering section");
        self.leave_current_section();
        if !self.state.get("_transition").is_null() {
            self.set_attribute("_transition", Value::Null);
        }

        let master = story.master().filter(|_| !name.is_empty());
        let cleared = (section.clear || master.is_some_and(|m| m.clear)) && self.output.clear_screen();

        let id = self.next_section_id();
        let mut output_section = OutputSection::new(id, name);
        output_section.clears = cleared;
        self.output.push_section(output_section);
        self.writing_passage = false;
        self.current_section = Some(name.to_string());
        self.set_attribute("_section", json!(name));
        self.mark_seen(name);

        if let Some(master) = master {
            self.run_node(master);
            self.write(Source::Master, master.text());
        }
        self.run_node(section);
        if self.pending_redirect.is_some() {
            debug!(section = name, "section redirected by its script");
            self.finish_section_step();
            return true;
        }
        self.set_attribute("_turncount", json!(0));
        self.write(Source::Section(name.to_string()), section.text());
        self.finish_section_step();
        true
    }

    fn next_section_id(&mut self) -> u64 {
        let count = to_number(&self.state.get("_section-count"));
        let count = if count.is_nan() { 1.0 } else { count + 1.0 };
        self.set_attribute("_section-count", number(count));
        count as u64
    }

    /// Inputs of the section being left write their values and lock.
    fn leave_current_section(&mut self) {
        let mut values = Vec::new();
        if let Some(section) = self.output.current_mut() {
            section.for_each_fragment_mut(&mut |fragment| {
                if let Fragment::Input(input) = fragment {
                    if !input.disabled {
                        values.push((input.attribute.clone(), input.value.clone()));
                        input.disabled = true;
                    }
                }
            });
        }
        for (attribute, value) in values {
            self.set_attribute(&attribute, Value::String(value));
        }
    }

    fn mark_seen(&mut self, name: &str) {
        let mut seen = match self.state.get("_seen_sections") {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        if !seen.iter().any(|v| v.as_str() == Some(name)) {
            seen.push(json!(name));
            self.set_attribute("_seen_sections", Value::Array(seen));
        }
    }

    fn finish_section_step(&mut self) {
        self.flush_undo(false);
        self.save();
        self.refresh_can_go_back();
        self.update_link_states();
    }

    fn finish_passage_step(&mut self) {
        self.flush_undo(true);
        self.save();
        self.refresh_can_go_back();
        self.update_link_states();
        self.writing_passage = false;
    }

    pub(crate) fn run_node(&mut self, node: &dyn StoryNode) {
        self.apply_attributes(node.attributes());
        if let Some(index) = node.script_index() {
            self.run_script(index);
        }
    }

    fn run_script(&mut self, index: usize) {
        let story = Rc::clone(&self.story);
        let Some(script) = story.scripts.get(index) else {
            warn!(index, "no script attached at this index");
            return;
        };
        let result = {
            let mut ctx = ScriptContext { session: self };
            catch_unwind(AssertUnwindSafe(|| script.call(&mut ctx)))
        };
        if result.is_err() {
            error!(index, "story script panicked");
        }
    }

    /// Render `text` and append it to the current section or passage block.
    pub(crate) fn write(&mut self, source: Source, text: &str) {
        let mut content = self.process_text(text);
        self.output.assign_ids(&mut content);
        match self
            .output
            .append_node(OutputNode::new(source, content), self.writing_passage)
        {
            Some(path) => self.notify_write(path),
            None => warn!("no open output to write into"),
        }
    }

    /// Show a passage of the current section, falling back to the master
    /// section's passage of the same name.
    pub(crate) fn show_passage(&mut self, name: &str) -> Result<(), RuntimeError> {
        let story = Rc::clone(&self.story);
        let section_name = self.current_section.clone().unwrap_or_default();
        let passage = story
            .passage(&section_name, name)
            .ok_or_else(|| RuntimeError::PassageNotFound {
                passage: name.to_string(),
                section: section_name.clone(),
            })?;
        debug!(passage = name, section = %section_name, "showing passage");
        self.mark_seen(name);
        let story_master = story.master().and_then(|m| m.passages.get(""));
        let section_master = match section_name.as_str() {
            "" => None,
            current => story.section(current).and_then(|s| s.passages.get("")),
        };
        let clears = passage.clear
            || story_master.is_some_and(|m| m.clear)
            || section_master.is_some_and(|m| m.clear);
        if clears {
            self.clear_for_passage(name);
        }

        if let Some(master) = story_master {
            self.run_node(master);
            self.write(Source::MasterPassage(String::new()), master.text());
        }
        if let Some(master) = section_master {
            self.run_node(master);
            self.write(Source::MasterPassage(section_name.clone()), master.text());
        }
        self.run_node(passage);
        self.write(Source::Passage(section_name, name.to_string()), passage.text());
        Ok(())
    }

    /// Hide the output for a clearing passage. The passage block moves into a
    /// placeholder section so `go_back` can find it.
    fn clear_for_passage(&mut self, name: &str) {
        let Some(section) = self.output.current_mut() else {
            return;
        };
        if section.passages.last().is_some_and(|p| p.content.is_empty()) {
            section.passages.pop();
        } else {
            // the block already shows an earlier passage of this step
            self.flush_undo(true);
        }
        let cleared = self.output.clear_screen();
        if cleared {
            let id = self.next_section_id();
            let section_name = self.current_section.clone().unwrap_or_default();
            let mut placeholder = OutputSection::new(id, &section_name);
            placeholder.placeholder = true;
            self.output.push_section(placeholder);
        }
        self.output.open_passage(name, cleared);
    }

    /// Handle a click on the link with this id. Returns whether it was handled.
    ///
    /// Clicks are refused while transitions are running, on links outside
    /// the current section, on disabled links, and on navigation links while
    /// the section's inputs are invalid.
    pub async fn click_link(&mut self, id: ElementId) -> Result<bool, RuntimeError> {
        if self.transitions.is_draining() {
            debug!(link = %id, "click refused while transitions run");
            return Ok(false);
        }
        let Some(current) = self.output.current_index() else {
            return Ok(false);
        };
        let link = match self.output.find_link(id) {
            Some((index, link)) if index == current => link.clone(),
            _ => {
                debug!(link = %id, "link is not in the current section");
                return Ok(false);
            }
        };
        if link.disabled {
            return Ok(false);
        }
        if link.kind.is_navigation() && !self.are_inputs_valid() {
            self.mark_invalid_inputs();
            self.update_link_states();
            return Ok(false);
        }

        self.run_link_animations(id);
        self.drain_transitions().await;

        let handled = match &link.kind {
            LinkKind::Passage { target } => {
                self.click_passage(id, &link, target)?;
                true
            }
            LinkKind::Section { target } => {
                self.click_section(id, &link, target);
                true
            }
            LinkKind::Handler { handler, .. } => self.click_handler(id, &link, handler),
        };
        if handled {
            self.emit(SessionEvent::LinkClick {
                link_type: link.kind.type_name().to_string(),
            });
        }
        self.drain_transitions().await;
        self.flush_events();
        Ok(handled)
    }

    fn disable_link(&mut self, id: ElementId) {
        if let Some(link) = self.output.link_mut(id) {
            link.disabled = true;
        }
    }

    fn click_passage(&mut self, id: ElementId, link: &Link, target: &str) -> Result<(), RuntimeError> {
        let destination = link.destination().unwrap_or("");
        if !destination.is_empty() && !destination.starts_with("@replace") && !self.passage_exists(destination) {
            return Err(RuntimeError::PassageNotFound {
                passage: destination.to_string(),
                section: self.current_section.clone().unwrap_or_default(),
            });
        }
        self.disable_link(id);
        let turn = to_number(&self.state.get("_turncount"));
        let turn = if turn.is_nan() { 1.0 } else { turn + 1.0 };
        self.set_attribute("_turncount", number(turn));
        self.apply_attributes(&link.set);
        let destination = self.process_link_target(target);

        self.output
            .open_passage(destination.as_deref().unwrap_or(""), false);
        self.writing_passage = true;
        let result = self.show_turn(destination.as_deref(), turn as usize);
        self.finish_passage_step();
        if let Some(next) = self.pending_redirect.take() {
            self.go(&next);
        }
        result
    }

    /// The clicked passage, then `@<turn>` and `@last` when due.
    fn show_turn(&mut self, destination: Option<&str>, turn: usize) -> Result<(), RuntimeError> {
        if let Some(destination) = destination {
            self.show_passage(destination)?;
        }
        let story = Rc::clone(&self.story);
        let section_name = self.current_section.clone().unwrap_or_default();
        let Some(section) = story.section(&section_name) else {
            return Ok(());
        };
        let turn_passage = format!("@{turn}");
        if section.passages.contains_key(&turn_passage) {
            self.show_passage(&turn_passage)?;
        }
        if section.passages.contains_key("@last") && turn >= section.passage_count() {
            self.show_passage("@last")?;
        }
        Ok(())
    }

    fn click_section(&mut self, id: ElementId, link: &Link, target: &str) {
        self.disable_link(id);
        self.apply_attributes(&link.set);
        let navigated = match self.process_link_target(target) {
            Some(destination) => self.go(&destination),
            None => false,
        };
        if !navigated {
            if let Some(link) = self.output.link_mut(id) {
                link.disabled = false;
            }
            self.flush_undo(false);
            self.save();
        }
    }

    fn click_handler(&mut self, id: ElementId, link: &Link, handler_type: &str) -> bool {
        let Some(handler) = self.link_handlers.get(handler_type) else {
            warn!(handler = handler_type, "no link handler registered for this type");
            return false;
        };
        let mut updated = link.clone();
        let result = {
            let mut host = PluginHost::new(self);
            catch_unwind(AssertUnwindSafe(|| handler(&mut host, &mut updated)))
        };
        let disable = match result {
            Ok(Ok(outcome)) => outcome.disable_link,
            Ok(Err(err)) => {
                error!(handler = handler_type, %err, "link handler failed");
                false
            }
            Err(_) => {
                error!(handler = handler_type, "link handler panicked");
                false
            }
        };
        updated.disabled |= disable;
        updated.id = Some(id);
        if let Some(slot) = self.output.link_mut(id) {
            *slot = updated;
        }
        let into_passage = self
            .output
            .current()
            .is_some_and(|s| !s.passages.is_empty());
        self.flush_undo(into_passage);
        self.save();
        true
    }
}
