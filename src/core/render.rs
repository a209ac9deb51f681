/// Template evaluation: segments in, output fragments out.
///
/// Conditions are evaluated before their branches, and only the taken branch
/// is rendered, so helpers with side effects in an untaken branch never run.

use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{debug, error, warn};

use crate::core::animation::{AnimationRequest, AnimationTarget, Transition, TransitionDescriptor};
use crate::core::helpers::{HelperCall, HelperOutput};
use crate::core::plugin::PluginHost;
use crate::core::session::Session;
use crate::core::template::{Expr, LinkMarkup, Segment, Template};
use crate::core::value::{display, truthy};
use crate::schema::output::{fragments_html, Fragment, Link};
use crate::schema::story::StoryNode;

const MAX_EMBED_DEPTH: usize = 8;

/// Result of evaluating an expression.
enum Evaluated {
    Value(Value),
    Fragments(Vec<Fragment>),
}

fn push_markup(out: &mut Vec<Fragment>, text: &str) {
    if !text.is_empty() {
        out.push(Fragment::Markup(text.to_string()));
    }
}

impl Session {
    /// Render template text. Text that fails to parse is logged and kept as-is.
    pub(crate) fn process_text(&mut self, text: &str) -> Vec<Fragment> {
        match Template::parse(text) {
            Ok(template) => self.render_segments(&template.segments),
            Err(err) => {
                warn!(%err, "template could not be parsed; writing it literally");
                vec![Fragment::Markup(text.to_string())]
            }
        }
    }

    pub(crate) fn render_segments(&mut self, segments: &[Segment]) -> Vec<Fragment> {
        let mut out = Vec::new();
        for segment in segments {
            self.render_segment(segment, &mut out);
        }
        out
    }

    fn render_segment(&mut self, segment: &Segment, out: &mut Vec<Fragment>) {
        match segment {
            Segment::Literal(text) => push_markup(out, text),
            Segment::Link {
                kind: LinkMarkup::Section,
                text,
                target,
                ..
            } => out.push(Fragment::Link(Link::section(target, text.clone()))),
            Segment::Link {
                kind: LinkMarkup::Passage,
                text,
                target,
                raw,
            } => {
                let destination = target.split(',').next().unwrap_or("").trim();
                if self.passage_exists(destination) {
                    out.push(Fragment::Link(Link::passage(target, text.clone())));
                } else {
                    push_markup(out, raw);
                }
            }
            Segment::Output { expr, raw } => match self.eval(expr) {
                Evaluated::Fragments(fragments) => out.extend(fragments),
                Evaluated::Value(value) => {
                    let text = display(&value);
                    if !text.is_empty() {
                        out.push(if *raw {
                            Fragment::Markup(text)
                        } else {
                            Fragment::Text(text)
                        });
                    }
                }
            },
            Segment::If {
                condition,
                negate,
                then,
                otherwise,
            } => {
                let taken = truthy(&self.eval_value(condition)) != *negate;
                let branch = if taken { then } else { otherwise };
                for segment in branch {
                    self.render_segment(segment, out);
                }
            }
            Segment::Label { name, body } => {
                let name = display(&self.eval_value(name));
                let content = self.render_segments(body);
                out.push(Fragment::Label { name, content });
            }
            Segment::Replace { name, body, source } => {
                let name = display(&self.eval_value(name));
                let content = self.render_segments(body);
                let descriptor = TransitionDescriptor {
                    helper: "replace".to_string(),
                    args: vec![Value::String(name.clone()), Value::String(source.clone())],
                    hash: Map::new(),
                };
                self.queue_replace(&name, content, Some(descriptor));
            }
            Segment::Block {
                helper,
                args,
                hash,
                body,
                source,
            } => {
                if self.helpers.contains(helper) {
                    match self.call_helper(helper, args, hash, Some(body), Some(source)) {
                        Evaluated::Fragments(fragments) => out.extend(fragments),
                        Evaluated::Value(value) => push_markup(out, &display(&value)),
                    }
                } else {
                    warn!(helper = %helper, "unknown block helper; rendering its body");
                    for segment in body {
                        self.render_segment(segment, out);
                    }
                }
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Evaluated {
        match expr {
            Expr::Literal(value) => Evaluated::Value(value.clone()),
            Expr::Attribute(name) => {
                if self.helpers.contains(name) {
                    self.call_helper(name, &[], &[], None, None)
                } else {
                    Evaluated::Value(self.state.get(name))
                }
            }
            Expr::Seen(name) => {
                let name = display(&self.eval_value(name));
                Evaluated::Value(Value::Bool(self.state.seen(&name)))
            }
            Expr::At(names) => {
                let current = self.state.get("_section");
                let current = current.as_str().unwrap_or("");
                let mut found = false;
                for name in names {
                    found |= match self.eval_value(name) {
                        Value::Array(items) => items.iter().any(|v| display(v) == current),
                        value => display(&value) == current,
                    };
                }
                Evaluated::Value(Value::Bool(found))
            }
            Expr::Embed(name) => {
                let name = display(&self.eval_value(name));
                Evaluated::Fragments(self.embed(&name))
            }
            Expr::Helper { name, args, hash } => self.call_helper(name, args, hash, None, None),
        }
    }

    /// Evaluate to a plain value; rendered output becomes its HTML.
    fn eval_value(&mut self, expr: &Expr) -> Value {
        match self.eval(expr) {
            Evaluated::Value(value) => value,
            Evaluated::Fragments(fragments) => Value::String(fragments_html(&fragments)),
        }
    }

    fn call_helper(
        &mut self,
        name: &str,
        args: &[Expr],
        hash: &[(String, Expr)],
        body: Option<&[Segment]>,
        body_source: Option<&str>,
    ) -> Evaluated {
        let Some(helper) = self.helpers.get(name) else {
            warn!(helper = %name, "unknown helper");
            return Evaluated::Value(Value::Null);
        };
        let args = args.iter().map(|a| self.eval_value(a)).collect();
        let hash = hash
            .iter()
            .map(|(k, e)| (k.clone(), self.eval_value(e)))
            .collect();
        let call = HelperCall {
            name,
            args,
            hash,
            body,
            body_source,
        };
        let result = {
            let mut host = PluginHost::new(self);
            catch_unwind(AssertUnwindSafe(|| helper(&mut host, &call)))
        };
        match result {
            Ok(Ok(HelperOutput::Value(value))) => Evaluated::Value(value),
            Ok(Ok(HelperOutput::Fragments(fragments))) => Evaluated::Fragments(fragments),
            Ok(Err(err)) => {
                error!(helper = %name, %err, "helper failed");
                Evaluated::Value(Value::Null)
            }
            Err(_) => {
                error!(helper = %name, "helper panicked");
                Evaluated::Value(Value::Null)
            }
        }
    }

    /// Processed text of a passage in the current section, else of a section.
    fn embed(&mut self, name: &str) -> Vec<Fragment> {
        if self.embed_depth >= MAX_EMBED_DEPTH {
            warn!(name, "embed nested too deeply");
            return Vec::new();
        }
        let story = Rc::clone(&self.story);
        let current = self.current_section.as_deref().unwrap_or("");
        let text = story
            .section(current)
            .and_then(|s| s.passages.get(name))
            .map(|p| p.text())
            .or_else(|| story.section(name).map(|s| s.text()));
        let Some(text) = text else {
            debug!(name, "nothing to embed");
            return Vec::new();
        };
        self.embed_depth += 1;
        let fragments = self.process_text(text);
        self.embed_depth -= 1;
        fragments
    }

    pub(crate) fn passage_exists(&self, name: &str) -> bool {
        let current = self.current_section.as_deref().unwrap_or("");
        self.story.passage(current, name).is_some()
    }

    /// Cross-fade a label to new content once the fade animation finishes.
    /// Does nothing when no such label is shown.
    pub(crate) fn queue_replace(
        &mut self,
        label: &str,
        content: Vec<Fragment>,
        descriptor: Option<TransitionDescriptor>,
    ) {
        if !self.output.has_label(label) {
            debug!(label, "no label to replace");
            return;
        }
        let fade = AnimationRequest::new("fade", AnimationTarget::Label(label.to_string()));
        let wait = self.animations.run(&fade);
        let name = label.to_string();
        let mut transition = Transition::new(wait).on_complete(move |session| {
            if let Some(target) = session.output.label_mut(&name) {
                *target = content;
            }
            session.output.adopt_all();
            session.save();
        });
        if let Some(descriptor) = descriptor {
            transition = transition.with_descriptor(descriptor);
        }
        self.add_transition(transition);
    }
}
