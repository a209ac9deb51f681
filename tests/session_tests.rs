/// Session integration tests: navigation, history, reload and persistence.

use futures::executor::block_on;
use futures::FutureExt;
use serde_json::{json, Value};
use squiffy_runtime::core::animation::Transition;
use squiffy_runtime::core::config::SessionConfig;
use squiffy_runtime::core::helpers::HelperOutput;
use squiffy_runtime::core::plugin::{Plugin, PluginError, PluginHost};
use squiffy_runtime::core::session::RuntimeError;
use squiffy_runtime::schema::event::{EventKind, SessionEvent};
use squiffy_runtime::schema::output::{ElementId, Fragment, Link};
use squiffy_runtime::{Passage, Section, Session, Story};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

fn fixture(name: &str) -> Story {
    Story::load_from_ron(Path::new(&format!("tests/fixtures/{name}.ron"))).unwrap()
}

fn begin(story: Story) -> Session {
    let mut session = Session::builder().story(story).build().unwrap();
    block_on(session.begin()).unwrap();
    session
}

/// Links are looked up in the current section only; older sections are
/// closed to clicks.
fn find_link(session: &Session, text: &str) -> Option<Link> {
    session
        .output()
        .current()?
        .links()
        .into_iter()
        .find(|l| l.text == text)
        .cloned()
}

fn link_id(session: &Session, text: &str) -> ElementId {
    find_link(session, text).and_then(|l| l.id).unwrap()
}

fn click(session: &mut Session, text: &str) -> bool {
    let id = link_id(session, text);
    block_on(session.click_link(id)).unwrap()
}

#[test]
fn hello_world_renders_default_section() {
    let session = begin(fixture("hello"));
    assert_eq!(session.current_section_name(), Some("_default"));
    assert_eq!(session.output().text(), "Hello world");
    assert_eq!(session.output().sections.len(), 1);
    assert!(session.output().sections[0].passages.is_empty());
    assert!(!session.can_go_back());
}

#[test]
fn links_in_previous_sections_are_rejected() {
    let mut session = begin(fixture("two_sections"));
    let b_in_first = link_id(&session, "b");

    assert!(click(&mut session, "a"));
    assert_eq!(session.current_section_name(), Some("a"));
    assert_eq!(session.get("_seen_sections"), json!(["_default", "a"]));

    assert!(!block_on(session.click_link(b_in_first)).unwrap());
    assert_eq!(session.current_section_name(), Some("a"));
}

#[test]
fn clicked_section_link_is_disabled_and_reenabled_on_back() {
    let mut session = begin(fixture("two_sections"));
    assert!(click(&mut session, "a"));
    let first = session.output().sections[0].links();
    assert!(first.iter().find(|l| l.text == "a").unwrap().disabled);

    session.go_back();
    let first = session.output().sections[0].links();
    assert!(!first.iter().any(|l| l.disabled));
}

#[test]
fn going_back_removes_attribute_created_by_step() {
    let story = Story::new("_default")
        .with_section("_default", Section::new("[[next]]"))
        .with_section("next", Section::new("Set.").with_attributes(&["test = 123"]));
    let mut session = begin(story);
    assert!(click(&mut session, "next"));
    assert_eq!(session.get("test"), json!(123));
    assert!(session.can_go_back());

    session.go_back();
    assert_eq!(session.get("test"), Value::Null);
    assert!(!session.can_go_back());
    assert_eq!(session.current_section_name(), Some("_default"));
}

#[test]
fn clear_moves_output_to_clear_stack_and_back() {
    let mut session = begin(fixture("clearing"));
    let before = session.output().sections.clone();

    assert!(click(&mut session, "later"));
    assert_eq!(session.output().text(), "After the clear.");
    assert_eq!(session.output().clear_stack.len(), 1);
    assert_eq!(session.output().clear_stack[0].sections[0].text(), before[0].text());
    assert_eq!(session.get("visited"), json!(2));

    session.go_back();
    assert!(session.output().clear_stack.is_empty());
    assert_eq!(session.output().sections, before);
    assert_eq!(session.get("visited"), json!(1));
}

#[test]
fn turn_passages_and_undo_across_them() {
    let mut session = begin(fixture("turns"));
    assert_eq!(session.get("_turncount"), json!(0));

    assert!(click(&mut session, "desk"));
    let text = session.output().text();
    assert!(text.contains("Papers everywhere."));
    assert!(text.contains("You start to get your bearings."));
    assert!(!text.contains("You have seen everything here."));
    // the master passage runs before every passage shown
    assert_eq!(session.get("looked"), json!(2));

    assert!(click(&mut session, "window"));
    let text = session.output().text();
    assert!(text.contains("Rain outside."));
    assert!(text.contains("You have seen everything here."));
    assert_eq!(session.get("_turncount"), json!(2));
    assert_eq!(session.get("looked"), json!(4));

    // both passage clicks disabled their links for good
    assert!(find_link(&session, "desk").unwrap().disabled);
    assert!(find_link(&session, "window").unwrap().disabled);

    session.go_back();
    assert_eq!(session.get("looked"), json!(2));
    assert_eq!(session.get("_turncount"), json!(1));
    assert!(!find_link(&session, "window").unwrap().disabled);
    assert!(!session.output().text().contains("Rain outside."));

    session.go_back();
    session.go_back();
    assert!(!session.can_go_back());
    assert_eq!(session.get("looked"), Value::Null);
}

#[test]
fn repeated_back_reaches_the_start() {
    let mut session = begin(fixture("two_sections"));
    assert!(click(&mut session, "a"));
    assert!(click(&mut session, "b"));
    let mut steps = 0;
    while session.can_go_back() {
        session.go_back();
        steps += 1;
    }
    assert_eq!(steps, 2);
    assert_eq!(session.current_section_name(), Some("_default"));
    session.go_back();
    assert_eq!(session.output().sections.len(), 1);
}

#[test]
fn untaken_branch_is_not_evaluated() {
    let session = begin(
        Story::new("s").with_section("s", Section::new("{{#if flag}}{{inc \"x\"}}{{/if}}done")),
    );
    assert_eq!(session.get("x"), Value::Null);
    assert_eq!(session.output().text(), "done");
}

#[test]
fn clicked_passage_link_stays_disabled_across_update() {
    let story = |text: &str| {
        Story::new("s").with_section(
            "s",
            Section::new(text)
                .with_passage("a", Passage::new("A shown"))
                .with_passage("b", Passage::new("B shown")),
        )
    };
    let mut session = begin(story("[a] or [b]"));
    assert!(click(&mut session, "a"));

    block_on(session.update(story("Pick [a] or maybe [b]"))).unwrap();
    assert!(session.output().text().starts_with("Pick"));
    assert!(find_link(&session, "a").unwrap().disabled);
    assert!(!find_link(&session, "b").unwrap().disabled);
    assert!(session.output().text().contains("A shown"));

    // fresh ids are clickable
    assert!(click(&mut session, "b"));
    assert!(session.output().text().contains("B shown"));
}

#[test]
fn embedded_text_is_not_patched_by_update() {
    let story = |inner: &str| {
        Story::new("s").with_section(
            "s",
            Section::new("Outer: {{embed \"inner\"}}").with_passage("inner", Passage::new(inner)),
        )
    };
    let mut session = begin(story("old inner"));
    assert_eq!(session.output().text(), "Outer: old inner");

    block_on(session.update(story("new inner"))).unwrap();
    assert_eq!(session.output().text(), "Outer: old inner");
}

#[test]
fn update_dropping_the_current_section_falls_back() {
    let mut session = begin(fixture("two_sections"));
    assert!(click(&mut session, "a"));

    let mut story = fixture("two_sections");
    story.sections.remove("a");
    block_on(session.update(story)).unwrap();
    assert_eq!(session.current_section_name(), Some("_default"));
    assert_eq!(session.output().sections.len(), 1);
}

#[test]
fn missing_section_is_ignored() {
    let mut session = begin(Story::new("s").with_section("s", Section::new("[[nowhere]]")));
    assert!(click(&mut session, "nowhere"));
    assert_eq!(session.current_section_name(), Some("s"));
    assert_eq!(session.output().sections.len(), 1);
    assert!(!find_link(&session, "nowhere").unwrap().disabled);
}

#[test]
fn missing_passage_is_an_error() {
    let with = Story::new("s").with_section(
        "s",
        Section::new("[gone]").with_passage("gone", Passage::new("here")),
    );
    let without = Story::new("s").with_section("s", Section::new("[gone]"));
    let mut session = begin(with);
    block_on(session.update(without)).unwrap();

    let id = link_id(&session, "gone");
    let result = block_on(session.click_link(id));
    assert!(matches!(
        result,
        Err(RuntimeError::PassageNotFound { ref passage, .. }) if passage == "gone"
    ));
    assert!(!find_link(&session, "gone").unwrap().disabled);
}

#[test]
fn events_report_clicks_and_history_changes() {
    let mut session = begin(fixture("turns"));
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    session.on(EventKind::LinkClick, move |_, event| {
        if let SessionEvent::LinkClick { link_type } = event {
            sink.borrow_mut().push(link_type.clone());
        }
        Ok(())
    });
    let sink = log.clone();
    session.on(EventKind::CanGoBackChanged, move |_, event| {
        if let SessionEvent::CanGoBackChanged { can_go_back } = event {
            sink.borrow_mut().push(format!("can_go_back={can_go_back}"));
        }
        Ok(())
    });

    assert!(click(&mut session, "desk"));
    session.go_back();
    assert_eq!(
        *log.borrow(),
        vec!["can_go_back=true", "passage", "can_go_back=false"]
    );
}

#[test]
fn failing_event_handlers_do_not_stop_others() {
    let mut session = begin(fixture("hello"));
    let seen = Rc::new(RefCell::new(Vec::new()));
    session.on(EventKind::Set, |_, _| Err(PluginError::Message("broken".into())));
    session.on(EventKind::Set, |_, _| -> Result<(), PluginError> { panic!("handler blew up") });
    let sink = seen.clone();
    session.on(EventKind::Set, move |_, event| {
        if let SessionEvent::Set { attribute, value } = event {
            sink.borrow_mut().push((attribute.clone(), value.clone()));
        }
        Ok(())
    });

    session.set("mood", json!("calm"));
    session.set("ready", None::<Value>);
    assert_eq!(session.get("ready"), json!(true));
    assert_eq!(
        *seen.borrow(),
        vec![("mood".to_string(), json!("calm")), ("ready".to_string(), json!(true))]
    );
}

/// Adds a `stall` helper whose transition never finishes.
struct Staller;

impl Plugin for Staller {
    fn name(&self) -> &str {
        "staller"
    }

    fn init(&self, host: &mut PluginHost<'_>) -> Result<(), PluginError> {
        host.register_helper("stall", |host, _| {
            host.add_transition(Transition::new(futures::future::pending::<()>()));
            Ok(HelperOutput::empty())
        });
        Ok(())
    }
}

#[test]
fn stalled_transition_blocks_navigation() {
    let story = Story::new("s")
        .with_section("s", Section::new("{{stall}}[[next]]"))
        .with_section("next", Section::new("Next"));
    let mut session = Session::builder()
        .story(story)
        .plugin(Rc::new(Staller))
        .build()
        .unwrap();

    assert!(session.begin().now_or_never().is_none());
    assert!(session.is_transitioning());

    let id = link_id(&session, "next");
    assert_eq!(session.click_link(id).now_or_never().map(|r| r.unwrap()), Some(false));
    assert_eq!(session.current_section_name(), Some("s"));
}

#[test]
fn invalid_inputs_hold_navigation() {
    let story = Story::new("form")
        .with_section("form", Section::new("{{input \"name\" required=true}} [[next]]"))
        .with_section("next", Section::new("Hello {{name}}"));
    let mut session = begin(story);
    assert!(!session.are_inputs_valid());
    assert!(find_link(&session, "next").unwrap().validation_disabled);
    assert!(!click(&mut session, "next"));

    let input = session
        .output()
        .current()
        .unwrap()
        .nodes()
        .flat_map(|n| n.content.iter())
        .find_map(|f| match f {
            Fragment::Input(input) => Some(input.clone()),
            _ => None,
        })
        .unwrap();
    assert!(input.invalid);

    assert!(session.set_input_value(input.id.unwrap(), "Grace"));
    assert!(session.are_inputs_valid());
    assert!(click(&mut session, "next"));
    assert_eq!(session.output().current().unwrap().text(), "Hello Grace");
}

#[test]
fn saved_session_resumes_from_file_storage() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        persist: true,
        storage_file: Some(dir.path().join("save.json")),
        ..SessionConfig::default()
    };

    {
        let mut session = Session::builder()
            .story(fixture("two_sections"))
            .config(&config)
            .build()
            .unwrap();
        block_on(session.begin()).unwrap();
        assert!(click(&mut session, "a"));
        session.set("score", json!(7));
    }

    let mut resumed = Session::builder()
        .story(fixture("two_sections"))
        .config(&config)
        .build()
        .unwrap();
    block_on(resumed.begin()).unwrap();
    assert_eq!(resumed.current_section_name(), Some("a"));
    assert_eq!(resumed.get("score"), json!(7));
    assert_eq!(resumed.output().sections.len(), 2);
    assert!(resumed.can_go_back());

    assert!(click(&mut resumed, "b"));
    assert_eq!(resumed.current_section_name(), Some("b"));

    block_on(resumed.restart()).unwrap();
    assert_eq!(resumed.current_section_name(), Some("_default"));
    assert_eq!(resumed.get("score"), Value::Null);
}

#[test]
fn independent_sessions_do_not_share_state() {
    let mut first = begin(fixture("two_sections"));
    let second = begin(fixture("two_sections"));
    assert!(click(&mut first, "a"));
    assert_eq!(first.current_section_name(), Some("a"));
    assert_eq!(second.current_section_name(), Some("_default"));
    assert_eq!(second.get("_seen_sections"), json!(["_default"]));
}
