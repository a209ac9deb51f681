/// Named template helpers and the built-in set.
///
/// Helpers receive evaluated positional arguments and `key=value` hash
/// arguments. Block helpers also receive their unrendered body, so the helper
/// decides whether (and how often) it is rendered.

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::rc::Rc;

use crate::core::plugin::{PluginError, PluginHost};
use crate::core::template::Segment;
use crate::core::value::{compare, display, loose_eq, number, to_number, truthy};
use crate::schema::output::{Constraints, Fragment, InputField, InputKind, Link};

/// One invocation of a helper.
#[derive(Debug)]
pub struct HelperCall<'a> {
    pub name: &'a str,
    pub args: Vec<Value>,
    pub hash: Map<String, Value>,
    /// Body of a block helper, `None` for inline calls.
    pub body: Option<&'a [Segment]>,
    /// Body as written, for helpers that need to store it.
    pub body_source: Option<&'a str>,
}

impl HelperCall<'_> {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Positional argument as text, or `MissingArgument`.
    pub fn str_arg(&self, index: usize) -> Result<String, PluginError> {
        match self.args.get(index) {
            Some(Value::Null) | None => Err(PluginError::MissingArgument(self.name.to_string())),
            Some(value) => Ok(display(value)),
        }
    }

    pub fn hash_str(&self, key: &str) -> Option<String> {
        self.hash
            .get(key)
            .filter(|v| !v.is_null())
            .map(display)
            .filter(|s| !s.is_empty())
    }
}

/// What a helper produced.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperOutput {
    /// A plain value, written as escaped text (or used as an argument).
    Value(Value),
    /// Rendered output such as links or spans.
    Fragments(Vec<Fragment>),
}

impl HelperOutput {
    /// No output.
    pub fn empty() -> Self {
        Self::Value(Value::Null)
    }
}

pub type HelperFn =
    dyn Fn(&mut PluginHost<'_>, &HelperCall<'_>) -> Result<HelperOutput, PluginError>;

#[derive(Default)]
pub struct HelperRegistry {
    helpers: FxHashMap<String, Rc<HelperFn>>,
}

impl HelperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in helpers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.add("set", set);
        registry.add("unset", unset);
        registry.add("inc", |host, call| step(host, call, 1.0));
        registry.add("dec", |host, call| step(host, call, -1.0));
        registry.add("get", get);
        registry.add("and", |_, call| {
            Ok(HelperOutput::Value(Value::Bool(call.args.iter().all(truthy))))
        });
        registry.add("or", |_, call| {
            Ok(HelperOutput::Value(Value::Bool(call.args.iter().any(truthy))))
        });
        registry.add("not", |_, call| {
            let value = call.args.first().unwrap_or(&Value::Null);
            Ok(HelperOutput::Value(Value::Bool(!truthy(value))))
        });
        registry.add("eq", |_, call| {
            let (a, b) = pair(call);
            Ok(HelperOutput::Value(Value::Bool(loose_eq(a, b))))
        });
        registry.add("ne", |_, call| {
            let (a, b) = pair(call);
            Ok(HelperOutput::Value(Value::Bool(!loose_eq(a, b))))
        });
        registry.add("gt", |_, call| ordered(call, |o| o.is_gt()));
        registry.add("lt", |_, call| ordered(call, |o| o.is_lt()));
        registry.add("gte", |_, call| ordered(call, |o| o.is_ge()));
        registry.add("lte", |_, call| ordered(call, |o| o.is_le()));
        registry.add("array", |_, call| Ok(HelperOutput::Value(Value::Array(call.args.clone()))));
        registry.add("section", |_, call| link_builder(call, |target, text| Link::section(target, text)));
        registry.add("passage", |_, call| link_builder(call, |target, text| Link::passage(target, text)));
        registry.add("input", |host, call| input_builder(host, call, false));
        registry.add("textarea", |host, call| input_builder(host, call, true));
        registry.add("replace", replace);
        registry
    }

    fn add<F>(&mut self, name: &str, helper: F)
    where
        F: Fn(&mut PluginHost<'_>, &HelperCall<'_>) -> Result<HelperOutput, PluginError> + 'static,
    {
        self.register(name, Rc::new(helper));
    }

    /// Register a helper, replacing any existing one with the same name.
    pub fn register(&mut self, name: &str, helper: Rc<HelperFn>) {
        self.helpers.insert(name.to_string(), helper);
    }

    pub fn get(&self, name: &str) -> Option<Rc<HelperFn>> {
        self.helpers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }
}

fn set(host: &mut PluginHost<'_>, call: &HelperCall<'_>) -> Result<HelperOutput, PluginError> {
    let attribute = call.str_arg(0)?;
    let value = match call.args.get(1) {
        Some(Value::Null) | None => Value::Bool(true),
        Some(value) => value.clone(),
    };
    host.set(&attribute, value);
    Ok(HelperOutput::empty())
}

fn unset(host: &mut PluginHost<'_>, call: &HelperCall<'_>) -> Result<HelperOutput, PluginError> {
    let attribute = call.str_arg(0)?;
    host.set(&attribute, Value::Bool(false));
    Ok(HelperOutput::empty())
}

fn step(host: &mut PluginHost<'_>, call: &HelperCall<'_>, sign: f64) -> Result<HelperOutput, PluginError> {
    let attribute = call.str_arg(0)?;
    let amount = match call.args.get(1) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(1.0),
        _ => 1.0,
    };
    let current = to_number(&host.get(&attribute));
    let current = if current.is_nan() { 0.0 } else { current };
    host.set(&attribute, number(current + sign * amount));
    Ok(HelperOutput::empty())
}

fn get(host: &mut PluginHost<'_>, call: &HelperCall<'_>) -> Result<HelperOutput, PluginError> {
    let attribute = call.str_arg(0)?;
    Ok(HelperOutput::Value(host.get(&attribute)))
}

fn pair<'a>(call: &'a HelperCall<'_>) -> (&'a Value, &'a Value) {
    (
        call.args.first().unwrap_or(&Value::Null),
        call.args.get(1).unwrap_or(&Value::Null),
    )
}

fn ordered(
    call: &HelperCall<'_>,
    test: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<HelperOutput, PluginError> {
    let (a, b) = pair(call);
    let result = compare(a, b).is_some_and(test);
    Ok(HelperOutput::Value(Value::Bool(result)))
}

/// `set="a=1, b"` on a link builder, split into attribute lines.
fn setters(call: &HelperCall<'_>) -> Vec<String> {
    call.hash_str("set")
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn link_builder(
    call: &HelperCall<'_>,
    make: fn(&str, String) -> Link,
) -> Result<HelperOutput, PluginError> {
    let target = call.str_arg(0)?;
    let text = call.hash_str("text").unwrap_or_else(|| target.clone());
    let mut link = make(&target, text);
    link.set = setters(call);
    Ok(HelperOutput::Fragments(vec![Fragment::Link(link)]))
}

fn input_builder(
    host: &mut PluginHost<'_>,
    call: &HelperCall<'_>,
    textarea: bool,
) -> Result<HelperOutput, PluginError> {
    let attribute = call.str_arg(0)?;
    let kind = if textarea {
        InputKind::TextArea
    } else {
        match call.hash_str("type").as_deref() {
            Some("number") => InputKind::Number,
            Some("email") => InputKind::Email,
            Some("text") | None => InputKind::Text,
            Some(other) => {
                return Err(PluginError::InvalidArgument {
                    helper: call.name.to_string(),
                    reason: format!("unsupported input type '{other}'"),
                })
            }
        }
    };
    let length = |key: &str| {
        call.hash
            .get(key)
            .map(to_number)
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as usize)
    };
    let bound = |key: &str| call.hash.get(key).map(to_number).filter(|n| n.is_finite());
    let constraints = Constraints {
        required: call.hash.get("required").is_some_and(truthy),
        min_length: length("minlength"),
        max_length: length("maxlength"),
        pattern: call.hash_str("pattern"),
        min: bound("min"),
        max: bound("max"),
    };
    // prefill from the attribute when it already has a value
    let value = match host.get(&attribute) {
        Value::Null => call.hash_str("value").unwrap_or_default(),
        existing => display(&existing),
    };
    Ok(HelperOutput::Fragments(vec![Fragment::Input(InputField {
        id: None,
        attribute,
        kind,
        value,
        constraints,
        disabled: false,
        invalid: false,
    })]))
}

/// Inline form of `replace`: `{{replace "label" "source text"}}`. This is
/// also how a replacement in flight is replayed after a restore.
fn replace(host: &mut PluginHost<'_>, call: &HelperCall<'_>) -> Result<HelperOutput, PluginError> {
    let label = call.str_arg(0)?;
    let source = call.args.get(1).map(display).unwrap_or_default();
    let content = host.process_text(&source);
    host.replace_label(&label, content);
    Ok(HelperOutput::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Session;
    use crate::schema::story::{Section, Story};
    use serde_json::json;

    fn session() -> Session {
        Session::builder()
            .story(Story::new("s").with_section("s", Section::new("")))
            .default_plugins(false)
            .build()
            .unwrap()
    }

    fn call<'a>(name: &'a str, args: Vec<Value>, hash: Map<String, Value>) -> HelperCall<'a> {
        HelperCall {
            name,
            args,
            hash,
            body: None,
            body_source: None,
        }
    }

    fn run(session: &mut Session, name: &str, args: Vec<Value>) -> HelperOutput {
        let helper = session.helpers.get(name).unwrap();
        let mut host = PluginHost::new(session);
        helper(&mut host, &call(name, args, Map::new())).unwrap()
    }

    #[test]
    fn inc_and_dec_default_to_zero() {
        let mut s = session();
        run(&mut s, "inc", vec![json!("score")]);
        run(&mut s, "inc", vec![json!("score"), json!(4)]);
        assert_eq!(s.get("score"), json!(5));
        run(&mut s, "dec", vec![json!("lives")]);
        assert_eq!(s.get("lives"), json!(-1));
    }

    #[test]
    fn set_and_unset() {
        let mut s = session();
        run(&mut s, "set", vec![json!("name"), json!("Ada")]);
        assert_eq!(s.get("name"), json!("Ada"));
        run(&mut s, "set", vec![json!("flag")]);
        assert_eq!(s.get("flag"), json!(true));
        run(&mut s, "unset", vec![json!("flag")]);
        assert_eq!(s.get("flag"), json!(false));
    }

    #[test]
    fn comparisons() {
        let mut s = session();
        let value = |out: HelperOutput| match out {
            HelperOutput::Value(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(value(run(&mut s, "eq", vec![json!(1), json!("1")])), json!(true));
        assert_eq!(value(run(&mut s, "gt", vec![json!(3), json!(2)])), json!(true));
        assert_eq!(value(run(&mut s, "lte", vec![json!(3), json!(2)])), json!(false));
        assert_eq!(value(run(&mut s, "and", vec![json!(1), json!("")])), json!(false));
        assert_eq!(value(run(&mut s, "or", vec![json!(0), json!("x")])), json!(true));
        assert_eq!(value(run(&mut s, "array", vec![json!("a"), json!("b")])), json!(["a", "b"]));
    }

    #[test]
    fn link_builders_carry_text_and_setters() {
        let mut s = session();
        let helper = s.helpers.get("section").unwrap();
        let mut hash = Map::new();
        hash.insert("text".into(), json!("Go north"));
        hash.insert("set".into(), json!("dir=north, moved"));
        let mut host = PluginHost::new(&mut s);
        let out = helper(&mut host, &call("section", vec![json!("north")], hash)).unwrap();
        match out {
            HelperOutput::Fragments(fragments) => match &fragments[0] {
                Fragment::Link(link) => {
                    assert_eq!(link.text, "Go north");
                    assert_eq!(link.destination(), Some("north"));
                    assert_eq!(link.set, vec!["dir=north".to_string(), "moved".to_string()]);
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn input_builder_reads_constraints() {
        let mut s = session();
        let helper = s.helpers.get("input").unwrap();
        let mut hash = Map::new();
        hash.insert("type".into(), json!("number"));
        hash.insert("required".into(), json!(true));
        hash.insert("min".into(), json!(1));
        hash.insert("max".into(), json!("10"));
        let mut host = PluginHost::new(&mut s);
        let out = helper(&mut host, &call("input", vec![json!("age")], hash)).unwrap();
        let HelperOutput::Fragments(fragments) = out else {
            panic!("expected fragments");
        };
        let Fragment::Input(input) = &fragments[0] else {
            panic!("expected input");
        };
        assert_eq!(input.kind, InputKind::Number);
        assert!(input.constraints.required);
        assert_eq!(input.constraints.min, Some(1.0));
        assert_eq!(input.constraints.max, Some(10.0));
    }

    #[test]
    fn missing_argument_is_an_error() {
        let mut s = session();
        let helper = s.helpers.get("inc").unwrap();
        let mut host = PluginHost::new(&mut s);
        assert!(matches!(
            helper(&mut host, &call("inc", vec![], Map::new())),
            Err(PluginError::MissingArgument(_))
        ));
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = HelperRegistry::with_builtins();
        registry.add("get", |_, _| Ok(HelperOutput::Value(json!("mine"))));
        let mut s = session();
        s.helpers = registry;
        assert_eq!(run(&mut s, "get", vec![json!("x")]), HelperOutput::Value(json!("mine")));
    }
}
