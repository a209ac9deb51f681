/// `{{rotate items}}` and `{{sequence items}}`: links that step through
/// their items on each click.
///
/// A rotate link cycles forever. A sequence link stops, and disables
/// itself, on its last item. `show="next"` labels the link with the item
/// that the next click selects instead of the current one; `set="attr"`
/// stores the selected item.

use serde_json::{json, Map, Value};

use crate::core::helpers::{HelperCall, HelperOutput};
use crate::core::link::HandleLinkResult;
use crate::core::plugin::{Plugin, PluginError, PluginHost};
use crate::core::value::display;
use crate::plugins::string_items;
use crate::schema::output::{Fragment, Link, LinkKind};

pub struct RotateSequencePlugin;

impl Plugin for RotateSequencePlugin {
    fn name(&self) -> &str {
        "rotateSequence"
    }

    fn init(&self, host: &mut PluginHost<'_>) -> Result<(), PluginError> {
        host.register_helper("rotate", |host, call| build_link(host, call, "rotate"));
        host.register_helper("sequence", |host, call| build_link(host, call, "sequence"));
        host.register_link_handler("rotate", |host, link| handle_click(host, link, true));
        host.register_link_handler("sequence", |host, link| handle_click(host, link, false));
        Ok(())
    }
}

/// The selected item and the items still to come. A rotation puts the
/// previously selected item back at the end.
fn rotate(mut options: Vec<String>, current: Option<String>) -> (String, Vec<String>) {
    let next = if options.is_empty() {
        String::new()
    } else {
        options.remove(0)
    };
    if let Some(current) = current.filter(|c| !c.is_empty()) {
        options.push(current);
    }
    (next, options)
}

fn label(selected: &str, remaining: &[String], show_next: bool) -> String {
    if show_next {
        remaining.first().cloned().unwrap_or_default()
    } else {
        selected.to_string()
    }
}

fn build_link(
    host: &mut PluginHost<'_>,
    call: &HelperCall<'_>,
    handler: &str,
) -> Result<HelperOutput, PluginError> {
    let (selected, remaining) = rotate(string_items(call), None);
    let attribute = call.hash_str("set").unwrap_or_default();
    if !attribute.is_empty() {
        host.set(&attribute, Value::String(selected.clone()));
    }
    let show = call.hash_str("show").unwrap_or_default();
    let text = label(&selected, &remaining, show == "next");

    let mut data = Map::new();
    data.insert("value".into(), json!(selected));
    data.insert("options".into(), json!(remaining));
    data.insert("show".into(), json!(show));
    data.insert("attribute".into(), json!(attribute));
    let link = Link::new(
        LinkKind::Handler {
            handler: handler.to_string(),
            data,
        },
        text,
    );
    Ok(HelperOutput::Fragments(vec![Fragment::Link(link)]))
}

fn handle_click(
    host: &mut PluginHost<'_>,
    link: &mut Link,
    is_rotate: bool,
) -> Result<HandleLinkResult, PluginError> {
    let LinkKind::Handler { data, .. } = &mut link.kind else {
        return Err(PluginError::Message("rotate/sequence handler given a navigation link".into()));
    };
    let options: Vec<String> = data
        .get("options")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(display).collect())
        .unwrap_or_default();
    let current = if is_rotate {
        data.get("value").map(display)
    } else {
        None
    };
    let (selected, remaining) = rotate(options, current);
    let show_next = data.get("show").and_then(Value::as_str) == Some("next");
    let attribute = data
        .get("attribute")
        .map(display)
        .unwrap_or_default();

    let text = label(&selected, &remaining, show_next);
    let exhausted = remaining.is_empty();
    data.insert("value".into(), json!(selected));
    data.insert("options".into(), json!(remaining));
    link.text = text;

    if !attribute.is_empty() {
        host.set(&attribute, Value::String(selected));
    }
    Ok(HandleLinkResult {
        disable_link: exhausted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::story::{Section, Story};
    use crate::Session;
    use futures::executor::block_on;

    fn begin(text: &str) -> Session {
        let story = Story::new("s").with_section("s", Section::new(text));
        let mut session = Session::builder().story(story).build().unwrap();
        block_on(session.begin()).unwrap();
        session
    }

    fn link(session: &Session) -> Link {
        session.output().current().unwrap().links()[0].clone()
    }

    fn click(session: &mut Session) -> bool {
        let id = link(session).id.unwrap();
        block_on(session.click_link(id)).unwrap()
    }

    #[test]
    fn rotation_order() {
        assert_eq!(
            rotate(vec!["b".into(), "c".into()], Some("a".into())),
            ("b".to_string(), vec!["c".to_string(), "a".to_string()])
        );
        assert_eq!(rotate(vec![], None), (String::new(), vec![]));
    }

    #[test]
    fn rotate_cycles_and_sets() {
        let mut session = begin("{{rotate \"a\" \"b\" \"c\" set=\"pick\"}}");
        assert_eq!(link(&session).text, "a");
        assert_eq!(session.get("pick"), json!("a"));
        for expected in ["b", "c", "a", "b"] {
            assert!(click(&mut session));
            assert_eq!(link(&session).text, expected);
            assert_eq!(session.get("pick"), json!(expected));
        }
        assert!(!link(&session).disabled);
    }

    #[test]
    fn sequence_stops_on_last_item() {
        let mut session = begin("{{sequence \"one\" \"two\" \"three\"}}");
        assert!(click(&mut session));
        assert_eq!(link(&session).text, "two");
        assert!(!link(&session).disabled);
        assert!(click(&mut session));
        assert_eq!(link(&session).text, "three");
        assert!(link(&session).disabled);
        assert!(!click(&mut session));
    }

    #[test]
    fn show_next_labels_with_upcoming_item() {
        let mut session = begin("{{rotate \"left\" \"right\" show=\"next\"}}");
        assert_eq!(link(&session).text, "right");
        assert!(click(&mut session));
        assert_eq!(link(&session).text, "left");
    }

    #[test]
    fn handler_changes_join_the_section_undo() {
        let mut session = begin("{{rotate \"x\" \"y\" set=\"pick\"}}");
        assert!(click(&mut session));
        assert_eq!(session.get("pick"), json!("y"));
        // the value from before the section was entered wins
        assert_eq!(session.output().current().unwrap().undo.get("pick"), Some(&Value::Null));
    }
}
