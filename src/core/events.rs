/// Publish/subscribe with deferred delivery.
///
/// `emit` only queues. Events are delivered later, when the owner drains the
/// queue with [`Emitter::next_dispatch`] after the triggering call has finished
/// its synchronous work. Handlers may emit further events; they are appended
/// and delivered in the same drain.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::rc::Rc;

use crate::schema::event::{EventKind, SessionEvent};

/// An event that can be routed by key.
pub trait Keyed {
    type Key: Copy + Eq + Hash;
    fn key(&self) -> Self::Key;
}

impl Keyed for SessionEvent {
    type Key = EventKind;

    fn key(&self) -> EventKind {
        self.kind()
    }
}

/// Returned by `on`/`once`; pass to `off` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener<H: ?Sized> {
    id: ListenerId,
    once: bool,
    handler: Rc<H>,
}

pub struct Emitter<E: Keyed, H: ?Sized> {
    listeners: FxHashMap<E::Key, Vec<Listener<H>>>,
    pending: VecDeque<E>,
    next_id: u64,
}

impl<E: Keyed, H: ?Sized> Default for Emitter<E, H> {
    fn default() -> Self {
        Self {
            listeners: FxHashMap::default(),
            pending: VecDeque::new(),
            next_id: 0,
        }
    }
}

impl<E: Keyed, H: ?Sized> Emitter<E, H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&mut self, key: E::Key, handler: Rc<H>, once: bool) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.entry(key).or_default().push(Listener {
            id,
            once,
            handler,
        });
        id
    }

    pub fn on(&mut self, key: E::Key, handler: Rc<H>) -> ListenerId {
        self.subscribe(key, handler, false)
    }

    /// Subscribe for the next matching event only.
    pub fn once(&mut self, key: E::Key, handler: Rc<H>) -> ListenerId {
        self.subscribe(key, handler, true)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        let mut removed = false;
        for listeners in self.listeners.values_mut() {
            let before = listeners.len();
            listeners.retain(|l| l.id != id);
            removed |= listeners.len() != before;
        }
        removed
    }

    pub fn listener_count(&self, key: E::Key) -> usize {
        self.listeners.get(&key).map_or(0, Vec::len)
    }

    /// Queue an event for later delivery.
    pub fn emit(&mut self, event: E) {
        self.pending.push_back(event);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pop the next queued event together with the handlers subscribed to it
    /// right now. Once-listeners are removed as they are handed out.
    pub fn next_dispatch(&mut self) -> Option<(E, Vec<Rc<H>>)> {
        let event = self.pending.pop_front()?;
        let handlers = match self.listeners.get_mut(&event.key()) {
            Some(listeners) => {
                let handlers = listeners.iter().map(|l| l.handler.clone()).collect();
                listeners.retain(|l| !l.once);
                handlers
            }
            None => Vec::new(),
        };
        Some((event, handlers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    type Handler = dyn Fn(&SessionEvent);

    fn set_event(name: &str) -> SessionEvent {
        SessionEvent::Set {
            attribute: name.to_string(),
            value: json!(1),
        }
    }

    fn drain(emitter: &mut Emitter<SessionEvent, Handler>) {
        while let Some((event, handlers)) = emitter.next_dispatch() {
            for handler in handlers {
                handler(&event);
            }
        }
    }

    #[test]
    fn emit_is_deferred_until_drained() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let mut emitter: Emitter<SessionEvent, Handler> = Emitter::new();
        emitter.on(
            EventKind::Set,
            Rc::new(move |e: &SessionEvent| sink.borrow_mut().push(e.clone())),
        );
        emitter.emit(set_event("a"));
        assert!(log.borrow().is_empty());
        assert!(emitter.has_pending());
        drain(&mut emitter);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn once_fires_a_single_time() {
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let mut emitter: Emitter<SessionEvent, Handler> = Emitter::new();
        emitter.once(EventKind::Set, Rc::new(move |_: &SessionEvent| *c.borrow_mut() += 1));
        emitter.emit(set_event("a"));
        emitter.emit(set_event("b"));
        drain(&mut emitter);
        assert_eq!(*count.borrow(), 1);
        assert_eq!(emitter.listener_count(EventKind::Set), 0);
    }

    #[test]
    fn off_unsubscribes() {
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let mut emitter: Emitter<SessionEvent, Handler> = Emitter::new();
        let id = emitter.on(EventKind::Set, Rc::new(move |_: &SessionEvent| *c.borrow_mut() += 1));
        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        emitter.emit(set_event("a"));
        drain(&mut emitter);
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn events_route_by_kind() {
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let mut emitter: Emitter<SessionEvent, Handler> = Emitter::new();
        emitter.on(
            EventKind::LinkClick,
            Rc::new(move |_: &SessionEvent| *c.borrow_mut() += 1),
        );
        emitter.emit(set_event("a"));
        emitter.emit(SessionEvent::LinkClick {
            link_type: "passage".to_string(),
        });
        drain(&mut emitter);
        assert_eq!(*count.borrow(), 1);
    }
}
