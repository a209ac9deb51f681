/// Registry of plugin link handlers, keyed by the link's handler type.

use rustc_hash::FxHashMap;
use std::rc::Rc;

use crate::core::plugin::{PluginError, PluginHost};
use crate::schema::output::Link;

/// What a handler decided about the clicked link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleLinkResult {
    pub disable_link: bool,
}

impl HandleLinkResult {
    pub fn disable() -> Self {
        Self { disable_link: true }
    }
}

/// A handler may rewrite the link in place (text, data) before it is put back.
pub type LinkHandlerFn =
    dyn Fn(&mut PluginHost<'_>, &mut Link) -> Result<HandleLinkResult, PluginError>;

#[derive(Default)]
pub struct LinkHandlerRegistry {
    handlers: FxHashMap<String, Rc<LinkHandlerFn>>,
}

impl LinkHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler_type: &str, handler: Rc<LinkHandlerFn>) {
        self.handlers.insert(handler_type.to_string(), handler);
    }

    pub fn get(&self, handler_type: &str) -> Option<Rc<LinkHandlerFn>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
