/// `{{live "attr"}}`: a span that shows an attribute and is refreshed every
/// time the attribute is set. With `section="name"` or `passage="name"` the
/// span shows that node's rendered text instead, re-rendered on each set.

use serde_json::json;
use tracing::debug;

use crate::core::helpers::{HelperCall, HelperOutput};
use crate::core::plugin::{Plugin, PluginError, PluginHost};
use crate::core::value::display;
use crate::schema::event::{EventKind, SessionEvent};
use crate::schema::output::{ElementId, Fragment, NodePath, Span};

const CLASS: &str = "squiffy-live";

pub struct LivePlugin;

impl Plugin for LivePlugin {
    fn name(&self) -> &str {
        "live"
    }

    fn init(&self, host: &mut PluginHost<'_>) -> Result<(), PluginError> {
        host.register_helper("live", live);
        host.on(EventKind::Set, on_set);
        Ok(())
    }

    // Filled here rather than in the helper so values set later in the same
    // node are picked up.
    fn on_write(&self, host: &mut PluginHost<'_>, path: NodePath) {
        let bindings = match host.output().node(path) {
            Some(node) => collect(&node.content, None),
            None => return,
        };
        refresh(host, bindings);
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Binding {
    Attribute(String),
    Section(String),
    Passage(String),
}

fn live(_host: &mut PluginHost<'_>, call: &HelperCall<'_>) -> Result<HelperOutput, PluginError> {
    let attribute = call.str_arg(0)?;
    let mut span = Span::new(CLASS);
    span.data.insert("attribute".into(), json!(attribute));
    if let Some(section) = call.hash_str("section") {
        span.data.insert("section".into(), json!(section));
    } else if let Some(passage) = call.hash_str("passage") {
        span.data.insert("passage".into(), json!(passage));
    }
    Ok(HelperOutput::Fragments(vec![Fragment::Span(span)]))
}

fn on_set(host: &mut PluginHost<'_>, event: &SessionEvent) -> Result<(), PluginError> {
    let SessionEvent::Set { attribute, .. } = event else {
        return Ok(());
    };
    let mut bindings = Vec::new();
    for section in &host.output().sections {
        for node in section.nodes() {
            bindings.extend(collect(&node.content, Some(attribute.as_str())));
        }
    }
    if bindings.is_empty() {
        return Ok(());
    }
    debug!(attribute = %attribute, spans = bindings.len(), "refreshing live spans");
    refresh(host, bindings);
    host.save();
    Ok(())
}

/// Live spans in `fragments`, optionally only those bound to `attribute`.
fn collect(fragments: &[Fragment], attribute: Option<&str>) -> Vec<(ElementId, Binding)> {
    let mut found = Vec::new();
    visit(fragments, attribute, &mut found);
    found
}

fn visit(fragments: &[Fragment], attribute: Option<&str>, found: &mut Vec<(ElementId, Binding)>) {
    for fragment in fragments {
        match fragment {
            Fragment::Span(span) if span.class == CLASS => {
                let bound = span.data_str("attribute");
                if attribute.is_some() && attribute != bound {
                    continue;
                }
                if let (Some(id), Some(binding)) = (span.id, binding(span)) {
                    found.push((id, binding));
                }
            }
            other => {
                if let Some(children) = other.children() {
                    visit(children, attribute, found);
                }
            }
        }
    }
}

fn binding(span: &Span) -> Option<Binding> {
    if let Some(section) = span.data_str("section") {
        Some(Binding::Section(section.to_string()))
    } else if let Some(passage) = span.data_str("passage") {
        Some(Binding::Passage(passage.to_string()))
    } else {
        span.data_str("attribute")
            .map(|a| Binding::Attribute(a.to_string()))
    }
}

fn refresh(host: &mut PluginHost<'_>, bindings: Vec<(ElementId, Binding)>) {
    for (id, binding) in bindings {
        let content = match binding {
            Binding::Attribute(attribute) => {
                let value = host.get(&attribute);
                Some(vec![Fragment::Text(display(&value))])
            }
            Binding::Section(name) => host.section_text(&name).map(|text| host.process_text(&text)),
            Binding::Passage(name) => host.passage_text(&name).map(|text| host.process_text(&text)),
        };
        let Some(content) = content else {
            continue;
        };
        if let Some(span) = host.output_mut().span_mut(id) {
            span.content = content;
        }
    }
    host.adopt_fragments();
}
