/// Attribute lines: the `attributes` of sections and passages, and the
/// comma-separated side effects carried by link targets.
///
/// ```text
/// x = 5          number
/// x = text       string
/// x = @y         copy of y
/// x := {{expr}}  rendered template
/// x += 2         also -=, *=, /=
/// not x          false
/// x              true
/// random : x = a|b|c
/// @replace label=passage-or-text
/// ```

use rand::Rng;
use regex::Regex;
use serde_json::Value;
use std::rc::Rc;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::core::animation::TransitionDescriptor;
use crate::core::session::Session;
use crate::core::value::{number, parse_number, to_number};
use crate::schema::output::fragments_html;
use crate::schema::story::StoryNode;

static RENDERED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\w*)\s*:=(.*)$").unwrap());
static RANDOM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^random\s*:\s*(\w+)\s*=\s*(.+)$").unwrap());
static ASSIGN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\w*)\s*=\s*(.*)$").unwrap());
static ARITHMETIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w*)\s*([+\-*/])=\s*(.*)$").unwrap());
static PARAGRAPH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^<p>(.*)</p>$").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum AssignValue {
    Number(f64),
    Text(String),
    /// `@name`: the current value of another attribute.
    CopyFrom(String),
}

impl AssignValue {
    fn classify(rhs: &str) -> Self {
        if let Some(n) = parse_number(rhs) {
            Self::Number(n)
        } else if let Some(source) = rhs.strip_prefix('@') {
            Self::CopyFrom(source.to_string())
        } else {
            Self::Text(rhs.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithmeticOp {
    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Subtract => lhs - rhs,
            Self::Multiply => lhs * rhs,
            Self::Divide => lhs / rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeAction {
    Assign { name: String, value: AssignValue },
    Rendered { name: String, template: String },
    Arithmetic { name: String, op: ArithmeticOp, operand: AssignValue },
    Flag { name: String, value: bool },
    Replace { label: String, content: String },
    Random { name: String, options: Vec<String> },
}

impl AttributeAction {
    /// Parse one line. `None` for lines that do nothing, such as a
    /// malformed `@replace`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("@replace ") {
            let caps = ASSIGN.captures(rest.trim())?;
            return Some(Self::Replace {
                label: caps[1].to_string(),
                content: caps[2].trim().to_string(),
            });
        }
        if let Some(caps) = RANDOM.captures(line) {
            return Some(Self::Random {
                name: caps[1].to_string(),
                options: caps[2].split('|').map(|o| o.trim().to_string()).collect(),
            });
        }
        if let Some(caps) = RENDERED.captures(line) {
            return Some(Self::Rendered {
                name: caps[1].trim().to_string(),
                template: caps[2].trim().to_string(),
            });
        }
        if let Some(caps) = ASSIGN.captures(line) {
            return Some(Self::Assign {
                name: caps[1].to_string(),
                value: AssignValue::classify(caps[2].trim()),
            });
        }
        if let Some(caps) = ARITHMETIC.captures(line) {
            let op = match &caps[2] {
                "+" => ArithmeticOp::Add,
                "-" => ArithmeticOp::Subtract,
                "*" => ArithmeticOp::Multiply,
                _ => ArithmeticOp::Divide,
            };
            return Some(Self::Arithmetic {
                name: caps[1].to_string(),
                op,
                operand: AssignValue::classify(caps[3].trim()),
            });
        }
        if line.is_empty() {
            return None;
        }
        match line.strip_prefix("not ") {
            Some(name) => Some(Self::Flag {
                name: name.trim().to_string(),
                value: false,
            }),
            None => Some(Self::Flag {
                name: line.to_string(),
                value: true,
            }),
        }
    }
}

impl Session {
    pub(crate) fn apply_attributes(&mut self, lines: &[String]) {
        for line in lines {
            self.apply_attribute_line(line);
        }
    }

    pub(crate) fn apply_attribute_line(&mut self, line: &str) {
        let Some(action) = AttributeAction::parse(line) else {
            debug!(line, "attribute line ignored");
            return;
        };
        match action {
            AttributeAction::Replace { label, content } => self.replace_from_line(&label, &content),
            AttributeAction::Assign { name, value } => self.assign(&name, value),
            AttributeAction::Rendered { name, template } => {
                let fragments = self.process_text(&template);
                let rendered = fragments_html(&fragments);
                self.assign(&name, AssignValue::classify(rendered.trim()));
            }
            AttributeAction::Random { name, options } => {
                if options.is_empty() {
                    return;
                }
                let pick = self.rng.gen_range(0..options.len());
                self.assign(&name, AssignValue::classify(&options[pick]));
            }
            AttributeAction::Arithmetic { name, op, operand } => {
                let rhs = self.resolve(operand);
                let current = self.state.get(&name);
                let lhs = if current.is_null() { 0.0 } else { to_number(&current) };
                self.set_attribute(&name, number(op.apply(lhs, to_number(&rhs))));
            }
            AttributeAction::Flag { name, value } => self.set_attribute(&name, Value::Bool(value)),
        }
    }

    fn resolve(&self, value: AssignValue) -> Value {
        match value {
            AssignValue::Number(n) => number(n),
            AssignValue::Text(text) => Value::String(text),
            AssignValue::CopyFrom(source) => self.state.get(&source),
        }
    }

    fn assign(&mut self, name: &str, value: AssignValue) {
        if name.is_empty() {
            warn!("attribute line without a name");
            return;
        }
        let value = self.resolve(value);
        self.set_attribute(name, value);
    }

    /// `@replace label=text`, where `text` may name a passage of the current
    /// section or a section whose text is used instead.
    fn replace_from_line(&mut self, label: &str, text: &str) {
        let story = Rc::clone(&self.story);
        let current = self.current_section.as_deref().unwrap_or("");
        let mut source = story
            .section(current)
            .and_then(|s| s.passages.get(text))
            .map(|p| p.text())
            .or_else(|| story.section(text).map(|s| s.text()))
            .unwrap_or(text)
            .to_string();
        if let Some(caps) = PARAGRAPH.captures(&source) {
            source = caps[1].to_string();
        }
        let content = self.process_text(&source);
        let descriptor = TransitionDescriptor {
            helper: "replace".to_string(),
            args: vec![Value::String(label.to_string()), Value::String(source)],
            hash: Default::default(),
        };
        self.queue_replace(label, content, Some(descriptor));
    }

    /// Apply a link target's side effects and return its destination.
    pub(crate) fn process_link_target(&mut self, target: &str) -> Option<String> {
        let mut destination = None;
        for (index, piece) in target.split(',').enumerate() {
            let piece = piece.trim();
            if let Some(rest) = piece.strip_prefix("@replace ") {
                if let Some(caps) = ASSIGN.captures(rest.trim()) {
                    self.replace_from_line(&caps[1], caps[2].trim());
                }
            } else if index == 0 {
                destination = Some(piece.to_string());
            } else if !piece.is_empty() {
                self.apply_attribute_line(piece);
            }
        }
        destination.filter(|d| !d.is_empty())
    }
}
