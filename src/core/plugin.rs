/// Plugin trait, plugin registry and the host surface plugins talk to.
///
/// A plugin's `init` receives a [`PluginHost`] and registers helpers, link
/// handlers, animations and event handlers through it. The same host type is
/// handed to helpers and handlers when they run.

use futures::future::LocalBoxFuture;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use thiserror::Error;
use tracing::error;

use crate::core::animation::{AnimationOptions, AnimationRequest, Transition};
use crate::core::events::ListenerId;
use crate::core::helpers::{HelperCall, HelperOutput};
use crate::core::link::HandleLinkResult;
use crate::core::session::Session;
use crate::core::template::{Segment, TemplateError};
use crate::schema::event::{EventKind, SessionEvent};
use crate::schema::output::{ElementId, Fragment, Link, NodePath, Output, OutputNode};
use crate::schema::story::StoryNode;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Message(String),
    #[error("helper '{0}' is missing a required argument")]
    MissingArgument(String),
    #[error("invalid argument to '{helper}': {reason}")]
    InvalidArgument { helper: String, reason: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
}

/// Handler subscribed to session events.
pub type EventHandler = dyn Fn(&mut PluginHost<'_>, &SessionEvent) -> Result<(), PluginError>;

pub trait Plugin {
    fn name(&self) -> &str;

    /// Register helpers, link handlers and event handlers.
    fn init(&self, host: &mut PluginHost<'_>) -> Result<(), PluginError>;

    /// Called after a node has been written to the output.
    fn on_write(&self, _host: &mut PluginHost<'_>, _path: NodePath) {}

    /// Called after a saved output has been restored or patched.
    fn on_load(&self, _host: &mut PluginHost<'_>) {}
}

#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Rc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Rc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    fn snapshot(&self) -> Vec<Rc<dyn Plugin>> {
        self.plugins.clone()
    }
}

impl Session {
    pub(crate) fn notify_write(&mut self, path: NodePath) {
        for plugin in self.plugins.snapshot() {
            let mut host = PluginHost::new(self);
            if catch_unwind(AssertUnwindSafe(|| plugin.on_write(&mut host, path))).is_err() {
                error!(plugin = plugin.name(), "plugin panicked in on_write");
            }
        }
    }

    pub(crate) fn notify_load(&mut self) {
        for plugin in self.plugins.snapshot() {
            let mut host = PluginHost::new(self);
            if catch_unwind(AssertUnwindSafe(|| plugin.on_load(&mut host))).is_err() {
                error!(plugin = plugin.name(), "plugin panicked in on_load");
            }
        }
    }
}

/// The session as seen by plugins, helpers and event handlers.
pub struct PluginHost<'a> {
    session: &'a mut Session,
}

impl<'a> PluginHost<'a> {
    pub(crate) fn new(session: &'a mut Session) -> Self {
        Self { session }
    }

    pub(crate) fn session(&mut self) -> &mut Session {
        self.session
    }

    /// Register a template helper. A later registration under the same name wins.
    pub fn register_helper<F>(&mut self, name: &str, helper: F)
    where
        F: Fn(&mut PluginHost<'_>, &HelperCall<'_>) -> Result<HelperOutput, PluginError> + 'static,
    {
        self.session.helpers.register(name, Rc::new(helper));
    }

    pub fn register_link_handler<F>(&mut self, handler_type: &str, handler: F)
    where
        F: Fn(&mut PluginHost<'_>, &mut Link) -> Result<HandleLinkResult, PluginError> + 'static,
    {
        self.session
            .link_handlers
            .register(handler_type, Rc::new(handler));
    }

    pub fn register_animation<F>(&mut self, name: &str, options: AnimationOptions, handler: F)
    where
        F: Fn(&AnimationRequest) -> LocalBoxFuture<'static, ()> + 'static,
    {
        self.session
            .animations
            .register(name, Rc::new(handler), options);
    }

    pub fn get(&self, attribute: &str) -> Value {
        self.session.state.get(attribute)
    }

    pub fn set(&mut self, attribute: &str, value: Value) {
        self.session.set_attribute(attribute, value);
    }

    pub fn seen(&self, name: &str) -> bool {
        self.session.state.seen(name)
    }

    pub fn current_section_name(&self) -> Option<&str> {
        self.session.current_section.as_deref()
    }

    pub fn section_text(&self, name: &str) -> Option<String> {
        self.session
            .story
            .section(name)
            .map(|s| s.text().to_string())
    }

    /// Text of a passage in the current section, falling back to the master section.
    pub fn passage_text(&self, name: &str) -> Option<String> {
        let section = self.session.current_section.as_deref().unwrap_or("");
        self.session
            .story
            .passage(section, name)
            .map(|p| p.text().to_string())
    }

    /// Render template text against the current state.
    pub fn process_text(&mut self, text: &str) -> Vec<Fragment> {
        self.session.process_text(text)
    }

    /// Render a block helper's body.
    pub fn render(&mut self, body: &[Segment]) -> Vec<Fragment> {
        self.session.render_segments(body)
    }

    pub fn add_transition(&mut self, transition: Transition) {
        self.session.add_transition(transition);
    }

    /// Queue a cross-fade of the named label to `content`.
    pub fn replace_label(&mut self, name: &str, content: Vec<Fragment>) {
        self.session.queue_replace(name, content, None);
    }

    pub fn run_animation(&self, request: &AnimationRequest) -> LocalBoxFuture<'static, ()> {
        self.session.animations.run(request)
    }

    /// Queue an animation as a transition, or start it detached if it loops.
    pub fn start_animation(&mut self, request: AnimationRequest) {
        self.session.start_animation(request);
    }

    pub fn animation_options(&self, name: &str) -> AnimationOptions {
        self.session.animations.options(name)
    }

    /// Run `request` when the link `link` is clicked.
    pub fn add_link_animation(&mut self, link: ElementId, request: AnimationRequest) {
        self.session.animations.add_link_animation(link, request);
    }

    pub fn has_link_animations(&self, link: ElementId) -> bool {
        !self.session.animations.link_animations(link).is_empty()
    }

    pub fn output(&self) -> &Output {
        &self.session.output
    }

    pub fn output_mut(&mut self) -> &mut Output {
        &mut self.session.output
    }

    pub fn node_mut(&mut self, path: NodePath) -> Option<&mut OutputNode> {
        self.session.output.node_mut(path)
    }

    /// Give ids to any links, inputs or spans a plugin inserted.
    pub fn adopt_fragments(&mut self) {
        self.session.output.adopt_all();
    }

    /// Persist the output after a plugin changed it.
    pub fn save(&mut self) {
        self.session.save();
    }

    /// A uniformly random index below `len` from the session's seeded generator.
    pub fn random_index(&mut self, len: usize) -> usize {
        use rand::Rng;
        if len == 0 {
            return 0;
        }
        self.session.rng.gen_range(0..len)
    }

    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&mut PluginHost<'_>, &SessionEvent) -> Result<(), PluginError> + 'static,
    {
        self.session.events.on(kind, Rc::new(handler))
    }

    pub fn once<F>(&mut self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&mut PluginHost<'_>, &SessionEvent) -> Result<(), PluginError> + 'static,
    {
        self.session.events.once(kind, Rc::new(handler))
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.session.events.off(id)
    }
}
