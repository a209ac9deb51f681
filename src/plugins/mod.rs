//! Built-in plugins, registered with every session unless
//! `SessionBuilder::default_plugins(false)` is used.

pub mod animate;
pub mod live;
pub mod random;
pub mod rotate_sequence;

use serde_json::Value;
use std::rc::Rc;

use crate::core::helpers::HelperCall;
use crate::core::plugin::Plugin;
use crate::core::value::display;

pub use animate::AnimatePlugin;
pub use live::LivePlugin;
pub use random::RandomPlugin;
pub use rotate_sequence::RotateSequencePlugin;

pub fn defaults() -> Vec<Rc<dyn Plugin>> {
    vec![
        Rc::new(RandomPlugin),
        Rc::new(RotateSequencePlugin),
        Rc::new(LivePlugin),
        Rc::new(AnimatePlugin),
    ]
}

/// Items of a list helper: `{{random (array "a" "b")}}` or `{{random "a" "b"}}`.
pub(crate) fn string_items(call: &HelperCall<'_>) -> Vec<String> {
    match call.args.as_slice() {
        [Value::Array(items)] => items.iter().map(display).collect(),
        args => args.iter().map(display).collect(),
    }
}
