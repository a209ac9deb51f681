/// `{{random items set="attr"}}`: one item picked with the session's seeded
/// generator.

use serde_json::Value;

use crate::core::helpers::{HelperCall, HelperOutput};
use crate::core::plugin::{Plugin, PluginError, PluginHost};
use crate::plugins::string_items;
use crate::schema::output::Fragment;

pub struct RandomPlugin;

impl Plugin for RandomPlugin {
    fn name(&self) -> &str {
        "random"
    }

    fn init(&self, host: &mut PluginHost<'_>) -> Result<(), PluginError> {
        host.register_helper("random", random);
        Ok(())
    }
}

fn random(host: &mut PluginHost<'_>, call: &HelperCall<'_>) -> Result<HelperOutput, PluginError> {
    let items = string_items(call);
    if items.is_empty() {
        return Ok(HelperOutput::empty());
    }
    let item = items[host.random_index(items.len())].clone();
    if let Some(attribute) = call.hash_str("set") {
        host.set(&attribute, Value::String(item.clone()));
    }
    Ok(HelperOutput::Fragments(vec![Fragment::Markup(item)]))
}
