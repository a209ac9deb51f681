/// The playback session: one story, its attributes, its output and history.
///
/// Built via `Session::builder()`. Every component of the runtime hangs off a
/// session instance, so independent sessions can coexist.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::core::animation::{AnimationRegistry, TransitionQueue};
use crate::core::config::{ConfigError, SessionConfig};
use crate::core::events::{Emitter, ListenerId};
use crate::core::helpers::HelperRegistry;
use crate::core::history::{UndoLog, UNTRACKED};
use crate::core::link::LinkHandlerRegistry;
use crate::core::plugin::{EventHandler, Plugin, PluginError, PluginHost, PluginManager};
use crate::core::state::{FileStorage, MemoryStorage, SetObserver, StateError, StateStore, Storage};
use crate::schema::event::{EventKind, SessionEvent};
use crate::schema::output::Output;
use crate::schema::story::{Story, StoryError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no story was given to the session builder")]
    MissingStory,
    #[error("no passage named '{passage}' in section '{section}' or the master section")]
    PassageNotFound { passage: String, section: String },
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
    #[error("story error: {0}")]
    Story(#[from] StoryError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("saved output could not be restored: {0}")]
    Restore(#[from] serde_json::Error),
}

pub struct Session {
    pub(crate) story: Rc<Story>,
    pub(crate) state: StateStore,
    pub(crate) events: Emitter<SessionEvent, EventHandler>,
    pub(crate) helpers: HelperRegistry,
    pub(crate) link_handlers: LinkHandlerRegistry,
    pub(crate) animations: AnimationRegistry,
    pub(crate) transitions: TransitionQueue,
    pub(crate) plugins: PluginManager,
    pub(crate) output: Output,
    /// Undo log of the step in progress.
    pub(crate) undo: UndoLog,
    pub(crate) capture_undo: bool,
    pub(crate) current_section: Option<String>,
    /// Section a script asked to go to while its own section was running.
    pub(crate) pending_redirect: Option<String>,
    /// Writes go to the open passage block rather than the section.
    pub(crate) writing_passage: bool,
    pub(crate) can_go_back_cached: bool,
    pub(crate) rng: StdRng,
    pub(crate) embed_depth: usize,
    flushing: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("start", &self.story.start)
            .field("current_section", &self.current_section)
            .field("history_depth", &self.output.history_depth())
            .field("plugins", &self.plugins.names())
            .finish()
    }
}

/// Builder for constructing a `Session`.
pub struct SessionBuilder {
    story: Option<Story>,
    seed: u64,
    persist: bool,
    story_id: Option<String>,
    storage: Option<Box<dyn Storage>>,
    storage_file: Option<PathBuf>,
    plugins: Vec<Rc<dyn Plugin>>,
    default_plugins: bool,
    on_set: Option<SetObserver>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder {
            story: None,
            seed: 0,
            persist: false,
            story_id: None,
            storage: None,
            storage_file: None,
            plugins: Vec::new(),
            default_plugins: true,
            on_set: None,
        }
    }

    pub fn story(&self) -> &Story {
        &self.story
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    /// The output projected to HTML.
    pub fn to_html(&self) -> String {
        self.output.to_html()
    }

    /// Name of the section the player is in.
    pub fn current_section_name(&self) -> Option<&str> {
        self.current_section.as_deref()
    }

    pub fn get(&self, attribute: &str) -> Value {
        self.state.get(attribute)
    }

    /// Set an attribute. `None` stores `true`.
    pub fn set(&mut self, attribute: &str, value: impl Into<Option<Value>>) {
        let value = value.into().unwrap_or(Value::Bool(true));
        self.set_attribute(attribute, value);
        self.flush_events();
    }

    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&mut PluginHost<'_>, &SessionEvent) -> Result<(), PluginError> + 'static,
    {
        self.events.on(kind, Rc::new(handler))
    }

    pub fn once<F>(&mut self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&mut PluginHost<'_>, &SessionEvent) -> Result<(), PluginError> + 'static,
    {
        self.events.once(kind, Rc::new(handler))
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Register a plugin and run its `init`.
    pub fn add_plugin(&mut self, plugin: Rc<dyn Plugin>) -> Result<(), PluginError> {
        debug!(plugin = plugin.name(), "initialising plugin");
        {
            let mut host = PluginHost::new(self);
            plugin.init(&mut host)?;
        }
        self.plugins.add(plugin);
        self.flush_events();
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.names()
    }

    /// The single write path for attributes: store, capture undo, publish.
    pub(crate) fn set_attribute(&mut self, attribute: &str, value: Value) {
        let previous = self.state.set(attribute, value.clone());
        if self.capture_undo && !UNTRACKED.contains(&attribute) {
            self.undo.record(attribute, previous);
        }
        self.emit(SessionEvent::Set {
            attribute: attribute.to_string(),
            value,
        });
    }

    pub(crate) fn emit(&mut self, event: SessionEvent) {
        self.events.emit(event);
    }

    /// Persist the output tree into `_output`.
    pub(crate) fn save(&mut self) {
        match serde_json::to_value(&self.output) {
            Ok(snapshot) => self.set_attribute("_output", snapshot),
            Err(err) => error!(%err, "failed to snapshot output"),
        }
    }

    /// Deliver queued events. Each handler runs in isolation: an error or a
    /// panic is logged and the remaining handlers still run.
    pub(crate) fn flush_events(&mut self) {
        if self.flushing {
            return;
        }
        self.flushing = true;
        while let Some((event, handlers)) = self.events.next_dispatch() {
            for handler in handlers {
                let result = {
                    let mut host = PluginHost::new(self);
                    catch_unwind(AssertUnwindSafe(|| handler(&mut host, &event)))
                };
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!(event = event.kind().name(), %err, "event handler failed"),
                    Err(_) => error!(event = event.kind().name(), "event handler panicked"),
                }
            }
        }
        self.flushing = false;
    }
}

impl SessionBuilder {
    pub fn story(mut self, story: Story) -> Self {
        self.story = Some(story);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Persist attributes through the storage backend.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Key prefix for persisted attributes. Defaults to the story's id.
    pub fn story_id(mut self, id: &str) -> Self {
        self.story_id = Some(id.to_string());
        self
    }

    pub fn storage(mut self, storage: Box<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn plugin(mut self, plugin: Rc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Whether to register the built-in plugins. On by default.
    pub fn default_plugins(mut self, enabled: bool) -> Self {
        self.default_plugins = enabled;
        self
    }

    /// Observe every attribute write with its new value.
    pub fn on_set<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, &Value) + 'static,
    {
        self.on_set = Some(Rc::new(observer));
        self
    }

    /// Apply settings loaded from a config file.
    pub fn config(mut self, config: &SessionConfig) -> Self {
        self.persist = config.persist;
        self.seed = config.seed;
        self.default_plugins = config.default_plugins;
        if let Some(id) = &config.story_id {
            self.story_id = Some(id.clone());
        }
        if let Some(path) = &config.storage_file {
            self.storage_file = Some(path.clone());
        }
        self
    }

    pub fn build(self) -> Result<Session, RuntimeError> {
        let story = self.story.ok_or(RuntimeError::MissingStory)?;
        let storage_key = self.story_id.or_else(|| story.id.clone());

        let storage = match (self.storage, &self.storage_file) {
            (Some(storage), _) => Some(storage),
            (None, Some(path)) => Some(Box::new(FileStorage::open(path)?) as Box<dyn Storage>),
            (None, None) => None,
        };

        let mut state = if self.persist {
            match (storage, storage_key) {
                (Some(backend), Some(key)) => StateStore::persistent(backend, &key),
                (None, Some(key)) => {
                    warn!("persistence requested without a storage backend; using memory storage");
                    StateStore::persistent(Box::new(MemoryStorage::new()), &key)
                }
                (_, None) => {
                    warn!("persistence requested but the story has no id; attributes will not be persisted");
                    StateStore::new()
                }
            }
        } else {
            StateStore::new()
        };
        if let Some(observer) = self.on_set {
            state.set_observer(observer);
        }

        let mut session = Session {
            story: Rc::new(story),
            state,
            events: Emitter::new(),
            helpers: HelperRegistry::with_builtins(),
            link_handlers: LinkHandlerRegistry::new(),
            animations: AnimationRegistry::new(),
            transitions: TransitionQueue::default(),
            plugins: PluginManager::new(),
            output: Output::new(),
            undo: UndoLog::new(),
            capture_undo: true,
            current_section: None,
            pending_redirect: None,
            writing_passage: false,
            can_go_back_cached: false,
            rng: StdRng::seed_from_u64(self.seed),
            embed_depth: 0,
            flushing: false,
        };

        if self.default_plugins {
            for plugin in crate::plugins::defaults() {
                session.add_plugin(plugin)?;
            }
        }
        for plugin in self.plugins {
            session.add_plugin(plugin)?;
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::story::Section;
    use serde_json::json;
    use std::cell::RefCell;

    fn story() -> Story {
        Story::new("start")
            .with_id("test-story")
            .with_section("start", Section::new("Hello"))
    }

    #[test]
    fn build_requires_story() {
        assert!(matches!(
            Session::builder().build(),
            Err(RuntimeError::MissingStory)
        ));
    }

    #[test]
    fn set_none_stores_true() {
        let mut session = Session::builder().story(story()).build().unwrap();
        session.set("flag", None::<Value>);
        assert_eq!(session.get("flag"), json!(true));
        session.set("n", json!(3));
        assert_eq!(session.get("n"), json!(3));
    }

    #[test]
    fn set_events_are_delivered_after_the_call() {
        let mut session = Session::builder().story(story()).build().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        session.on(EventKind::Set, move |host, event| {
            if let SessionEvent::Set { attribute, value } = event {
                // state is already visible to the handler
                assert_eq!(&host.get(attribute), value);
                sink.borrow_mut().push(attribute.clone());
            }
            Ok(())
        });
        session.set("a", json!(1));
        assert_eq!(*seen.borrow(), vec!["a".to_string()]);
    }

    #[test]
    fn failing_handlers_do_not_stop_others() {
        let mut session = Session::builder().story(story()).build().unwrap();
        let count = Rc::new(RefCell::new(0));
        session.on(EventKind::Set, |_, _| Err(PluginError::Message("boom".into())));
        session.on(EventKind::Set, |_, _| panic!("handler bug"));
        let c = count.clone();
        session.on(EventKind::Set, move |_, _| {
            *c.borrow_mut() += 1;
            Ok(())
        });
        session.set("a", json!(1));
        session.set("b", json!(2));
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn on_set_observer_is_called() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let mut session = Session::builder()
            .story(story())
            .on_set(move |name, value| sink.borrow_mut().push((name.to_string(), value.clone())))
            .build()
            .unwrap();
        session.set("x", json!("y"));
        assert_eq!(*log.borrow(), vec![("x".to_string(), json!("y"))]);
    }

    #[test]
    fn persistence_uses_story_id_by_default() {
        let storage = MemoryStorage::new();
        let mut session = Session::builder()
            .story(story())
            .persist(true)
            .storage(Box::new(storage.clone()))
            .build()
            .unwrap();
        session.set("score", json!(4));
        assert_eq!(storage.get_item("test-story-score").as_deref(), Some("4"));
    }

    #[test]
    fn persistence_without_id_falls_back_to_memory() {
        let storage = MemoryStorage::new();
        let mut session = Session::builder()
            .story(Story::new("start").with_section("start", Section::new("x")))
            .persist(true)
            .storage(Box::new(storage.clone()))
            .build()
            .unwrap();
        session.set("score", json!(4));
        assert!(storage.is_empty());
        assert_eq!(session.get("score"), json!(4));
    }

    #[test]
    fn default_plugins_are_registered() {
        let session = Session::builder().story(story()).build().unwrap();
        let names = session.plugin_names();
        for expected in ["random", "rotateSequence", "live", "animate"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
        let bare = Session::builder()
            .story(story())
            .default_plugins(false)
            .build()
            .unwrap();
        assert!(bare.plugin_names().is_empty());
    }
}
