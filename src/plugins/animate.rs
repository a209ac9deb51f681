/// `{{#animate "name" ..}}content{{/animate}}`: runs a registered animation
/// over its content.
///
/// The animation starts when the span is written, or when one of the links
/// inside it is clicked if `trigger="link"`. `loop=true` runs it detached.
/// Finished spans carry `done: true` and are not animated again when a saved
/// session is restored.

use serde_json::{json, Value};

use crate::core::animation::{AnimationRequest, AnimationTarget};
use crate::core::helpers::{HelperCall, HelperOutput};
use crate::core::plugin::{Plugin, PluginError, PluginHost};
use crate::core::value::truthy;
use crate::schema::output::{ElementId, Fragment, NodePath, Span};

const CLASS: &str = "squiffy-animate";

pub struct AnimatePlugin;

impl Plugin for AnimatePlugin {
    fn name(&self) -> &str {
        "animate"
    }

    fn init(&self, host: &mut PluginHost<'_>) -> Result<(), PluginError> {
        host.register_helper("animate", animate);
        Ok(())
    }

    fn on_write(&self, host: &mut PluginHost<'_>, path: NodePath) {
        let pending = match host.output().node(path) {
            Some(node) => pending_spans(&node.content),
            None => return,
        };
        set_up(host, pending);
    }

    fn on_load(&self, host: &mut PluginHost<'_>) {
        let mut pending = Vec::new();
        for section in &host.output().sections {
            for node in section.nodes() {
                pending.extend(pending_spans(&node.content));
            }
        }
        set_up(host, pending);
    }
}

fn animate(host: &mut PluginHost<'_>, call: &HelperCall<'_>) -> Result<HelperOutput, PluginError> {
    let name = call.str_arg(0)?;
    let content = match call.body {
        Some(body) => host.render(body),
        None => Vec::new(),
    };
    let mut span = Span::new(CLASS);
    span.data.insert("name".into(), json!(name));
    for (key, value) in &call.hash {
        span.data.insert(key.clone(), value.clone());
    }
    if host.animation_options(&name).initially_hidden {
        span.data.insert("hidden".into(), Value::Bool(true));
    }
    span.data.insert("done".into(), Value::Bool(false));
    span.content = content;
    Ok(HelperOutput::Fragments(vec![Fragment::Span(span)]))
}

/// An animation waiting to run, with the links that trigger it.
struct Pending {
    request: AnimationRequest,
    trigger_links: Option<Vec<ElementId>>,
}

fn pending_spans(fragments: &[Fragment]) -> Vec<Pending> {
    let mut found = Vec::new();
    visit(fragments, &mut found);
    found
}

fn visit(fragments: &[Fragment], found: &mut Vec<Pending>) {
    for fragment in fragments {
        match fragment {
            Fragment::Span(span) if span.class == CLASS => {
                if let Some(pending) = pending(span) {
                    found.push(pending);
                }
            }
            other => {
                if let Some(children) = other.children() {
                    visit(children, found);
                }
            }
        }
    }
}

fn pending(span: &Span) -> Option<Pending> {
    let id = span.id?;
    let name = span.data_str("name")?;
    if span.data.get("done").is_some_and(truthy) {
        return None;
    }
    let mut request = AnimationRequest::new(name, AnimationTarget::Element(id));
    request.params = span.data.clone();
    request.looping = span.data.get("loop").is_some_and(truthy);

    let trigger_links = (span.data_str("trigger") == Some("link")).then(|| {
        let mut links = Vec::new();
        collect_links(&span.content, &mut links);
        links
    });
    Some(Pending {
        request,
        trigger_links,
    })
}

fn collect_links(fragments: &[Fragment], links: &mut Vec<ElementId>) {
    for fragment in fragments {
        match fragment {
            Fragment::Link(link) => links.extend(link.id),
            other => {
                if let Some(children) = other.children() {
                    collect_links(children, links);
                }
            }
        }
    }
}

fn set_up(host: &mut PluginHost<'_>, pending: Vec<Pending>) {
    for Pending {
        request,
        trigger_links,
    } in pending
    {
        match trigger_links {
            Some(links) => {
                for link in links {
                    if !host.has_link_animations(link) {
                        host.add_link_animation(link, request.clone());
                    }
                }
            }
            None => host.start_animation(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::story::{Section, Story};
    use crate::Session;
    use futures::channel::oneshot;
    use futures::executor::block_on;
    use futures::FutureExt;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn spans(session: &Session) -> Vec<Span> {
        let mut out = Vec::new();
        for section in &session.output().sections {
            section.for_each_fragment(&mut |f| {
                if let Fragment::Span(span) = f {
                    if span.class == CLASS {
                        out.push(span.clone());
                    }
                }
            });
        }
        out
    }

    #[test]
    fn built_in_animation_completes_headless() {
        let story = Story::new("s").with_section("s", Section::new("{{#animate \"typewriter\"}}Hello{{/animate}}"));
        let mut session = Session::builder().story(story).build().unwrap();
        block_on(session.begin()).unwrap();
        let span = &spans(&session)[0];
        assert_eq!(span.data.get("hidden"), Some(&json!(true)));
        assert_eq!(span.data.get("done"), Some(&json!(true)));
        assert_eq!(session.output().text(), "Hello");
        assert!(!session.is_transitioning());
    }

    /// Registers a `slow` animation that waits on a channel the test holds.
    struct Slow {
        gate: RefCell<Option<oneshot::Receiver<()>>>,
    }

    impl Plugin for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn init(&self, host: &mut PluginHost<'_>) -> Result<(), PluginError> {
            let gate = self.gate.borrow_mut().take();
            let gate = Rc::new(RefCell::new(gate));
            host.register_animation("slow", Default::default(), move |_| {
                let rx = gate.borrow_mut().take();
                async move {
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                }
                .boxed_local()
            });
            Ok(())
        }
    }

    #[test]
    fn link_trigger_waits_for_click() {
        let story = Story::new("s")
            .with_section("s", Section::new("{{#animate \"slow\" trigger=\"link\"}}[[next]]{{/animate}}"))
            .with_section("next", Section::new("Next"));
        let (tx, rx) = oneshot::channel();
        let mut session = Session::builder()
            .story(story)
            .plugin(Rc::new(Slow {
                gate: RefCell::new(Some(rx)),
            }))
            .build()
            .unwrap();
        block_on(session.begin()).unwrap();
        assert!(!session.is_transitioning());
        assert_eq!(spans(&session)[0].data.get("done"), Some(&json!(false)));

        tx.send(()).unwrap();
        let link = session.output().current().unwrap().links()[0].id.unwrap();
        assert!(block_on(session.click_link(link)).unwrap());
        assert_eq!(session.current_section_name(), Some("next"));
        assert_eq!(spans(&session)[0].data.get("done"), Some(&json!(true)));
    }

    #[test]
    fn looping_animation_does_not_block() {
        let story = Story::new("s").with_section(
            "s",
            Section::new("{{#animate \"slow\" loop=true}}spin{{/animate}}[[next]]"),
        );
        let (_tx, rx) = oneshot::channel();
        let mut session = Session::builder()
            .story(story.with_section("next", Section::new("Next")))
            .plugin(Rc::new(Slow {
                gate: RefCell::new(Some(rx)),
            }))
            .build()
            .unwrap();
        block_on(session.begin()).unwrap();
        assert!(!session.is_transitioning());
        let link = session.output().current().unwrap().links()[0].id.unwrap();
        assert!(block_on(session.click_link(link)).unwrap());
        assert_eq!(session.current_section_name(), Some("next"));
    }
}
