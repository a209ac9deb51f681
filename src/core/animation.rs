/// Named animations and the transition queue.
///
/// Transitions are futures queued during a render step. Navigation and link
/// clicks drain the queue before doing anything else, and clicks are refused
/// while a drain is in progress. A transition that never completes blocks
/// navigation for good; there is no timeout.

use futures::future::{FutureExt, LocalBoxFuture};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;
use tracing::{debug, error, warn};

use crate::core::session::Session;
use crate::schema::output::ElementId;

/// What an animation runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnimationTarget {
    Label(String),
    Element(ElementId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnimationRequest {
    pub name: String,
    pub target: AnimationTarget,
    pub params: Map<String, Value>,
    pub looping: bool,
}

impl AnimationRequest {
    pub fn new(name: &str, target: AnimationTarget) -> Self {
        Self {
            name: name.to_string(),
            target,
            params: Map::new(),
            looping: false,
        }
    }
}

/// Resolves when the animation has finished.
pub type AnimationHandler = dyn Fn(&AnimationRequest) -> LocalBoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnimationOptions {
    /// Content starts hidden and is revealed by the animation.
    pub initially_hidden: bool,
}

struct Registered {
    handler: Rc<AnimationHandler>,
    options: AnimationOptions,
}

pub struct AnimationRegistry {
    animations: FxHashMap<String, Registered>,
    link_animations: FxHashMap<ElementId, Vec<AnimationRequest>>,
}

impl Default for AnimationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn immediate(_: &AnimationRequest) -> LocalBoxFuture<'static, ()> {
    futures::future::ready(()).boxed_local()
}

impl AnimationRegistry {
    /// A registry with the built-in animations. They complete at once; a
    /// host with a real surface re-registers them.
    pub fn new() -> Self {
        let mut registry = Self {
            animations: FxHashMap::default(),
            link_animations: FxHashMap::default(),
        };
        let hidden = AnimationOptions {
            initially_hidden: true,
        };
        for name in ["typewriter", "toast", "fadeIn"] {
            registry.register(name, Rc::new(immediate), hidden);
        }
        registry.register("continue", Rc::new(immediate), AnimationOptions::default());
        registry.register("fade", Rc::new(immediate), AnimationOptions::default());
        registry
    }

    pub fn register(&mut self, name: &str, handler: Rc<AnimationHandler>, options: AnimationOptions) {
        self.animations
            .insert(name.to_string(), Registered { handler, options });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.animations.contains_key(name)
    }

    /// Options of a registered animation; defaults for unknown names.
    pub fn options(&self, name: &str) -> AnimationOptions {
        self.animations
            .get(name)
            .map(|a| a.options)
            .unwrap_or_default()
    }

    /// Start an animation. An unknown name logs a warning and completes at once.
    pub fn run(&self, request: &AnimationRequest) -> LocalBoxFuture<'static, ()> {
        match self.animations.get(&request.name) {
            Some(animation) => (animation.handler)(request),
            None => {
                warn!(animation = %request.name, "no animation registered with this name");
                futures::future::ready(()).boxed_local()
            }
        }
    }

    pub fn add_link_animation(&mut self, link: ElementId, request: AnimationRequest) {
        self.link_animations.entry(link).or_default().push(request);
    }

    pub fn link_animations(&self, link: ElementId) -> Vec<AnimationRequest> {
        self.link_animations.get(&link).cloned().unwrap_or_default()
    }

    pub fn clear_link_animations(&mut self) {
        self.link_animations.clear();
    }
}

/// Serializable record of a transition in flight, replayed through the
/// helper registry when a saved session is restored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDescriptor {
    pub helper: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub hash: Map<String, Value>,
}

type Completion = Box<dyn FnOnce(&mut Session)>;

pub struct Transition {
    wait: LocalBoxFuture<'static, ()>,
    complete: Option<Completion>,
    descriptor: Option<TransitionDescriptor>,
}

impl Transition {
    pub fn new<F>(wait: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        Self {
            wait: wait.boxed_local(),
            complete: None,
            descriptor: None,
        }
    }

    /// A transition with nothing to wait for.
    pub fn ready() -> Self {
        Self::new(futures::future::ready(()))
    }

    /// Run `f` against the session once the wait is over.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut Session) + 'static,
    {
        self.complete = Some(Box::new(f));
        self
    }

    pub fn with_descriptor(mut self, descriptor: TransitionDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }
}

#[derive(Default)]
pub struct TransitionQueue {
    pending: VecDeque<Transition>,
    draining: bool,
}

impl TransitionQueue {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }
}

impl Session {
    /// Queue a transition. Its descriptor, if any, is stored in `_transition`.
    pub fn add_transition(&mut self, transition: Transition) {
        if let Some(descriptor) = &transition.descriptor {
            match serde_json::to_value(descriptor) {
                Ok(value) => self.set_attribute("_transition", value),
                Err(err) => error!(%err, "failed to record transition"),
            }
        }
        self.transitions.pending.push_back(transition);
    }

    /// Whether a drain is in progress (or stalled).
    pub fn is_transitioning(&self) -> bool {
        self.transitions.draining
    }

    /// Run every queued transition to completion, in order.
    pub(crate) async fn drain_transitions(&mut self) {
        if self.transitions.draining {
            return;
        }
        if self.transitions.pending.is_empty() {
            return;
        }
        self.transitions.draining = true;
        while let Some(transition) = self.transitions.pending.pop_front() {
            transition.wait.await;
            if let Some(complete) = transition.complete {
                complete(self);
            }
        }
        self.transitions.draining = false;
        debug!("transitions drained");
        if !self.state.get("_transition").is_null() {
            self.set_attribute("_transition", Value::Null);
        }
    }

    /// Run an animation as a transition. Looping animations are started and
    /// not waited for.
    pub(crate) fn start_animation(&mut self, request: AnimationRequest) {
        let wait = self.animations.run(&request);
        if request.looping {
            // nothing ever waits on a loop
            drop(wait);
            return;
        }
        let target = request.target;
        self.add_transition(Transition::new(wait).on_complete(move |session| {
            if let AnimationTarget::Element(id) = target {
                if let Some(span) = session.output.span_mut(id) {
                    span.data.insert("done".to_string(), Value::Bool(true));
                }
            }
            session.save();
        }));
    }

    /// Start the animations attached to a link.
    pub(crate) fn run_link_animations(&mut self, link: ElementId) {
        for request in self.animations.link_animations(link) {
            self.start_animation(request);
        }
    }

    /// Drop every queued transition and lift a stalled drain.
    pub(crate) fn reset_transitions(&mut self) {
        self.transitions = TransitionQueue::default();
        self.animations.clear_link_animations();
    }
}
