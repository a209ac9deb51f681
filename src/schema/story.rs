/// Compiled story data: sections, passages and script callbacks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

use crate::core::navigation::ScriptContext;
use crate::schema::output::Source;

#[derive(Debug, Error)]
pub enum StoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("JSON deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A script callback attached to a section or passage.
///
/// Callbacks are values handed over by the host; they cannot be serialized
/// and are attached after loading with [`Story::add_script`].
#[derive(Clone)]
pub struct ScriptFn(Rc<dyn Fn(&mut ScriptContext<'_>)>);

impl ScriptFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut ScriptContext<'_>) + 'static,
    {
        Self(Rc::new(f))
    }

    pub fn call(&self, ctx: &mut ScriptContext<'_>) {
        (self.0)(ctx)
    }
}

impl fmt::Debug for ScriptFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScriptFn(..)")
    }
}

/// Shared shape of sections and passages, used by the navigation engine
/// and the reconciler.
pub trait StoryNode {
    fn text(&self) -> &str;
    fn clear(&self) -> bool;
    fn attributes(&self) -> &[String];
    fn script_index(&self) -> Option<usize>;
}

/// A secondary content node inside a section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub clear: bool,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default, alias = "jsIndex", alias = "scriptIndex")]
    pub script_index: Option<usize>,
}

/// A top-level narrative node. The section named `""` is the master section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub clear: bool,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default, alias = "jsIndex", alias = "scriptIndex")]
    pub script_index: Option<usize>,
    #[serde(default)]
    pub passages: HashMap<String, Passage>,
    #[serde(default, alias = "passageCount")]
    pub passage_count: Option<usize>,
}

impl StoryNode for Passage {
    fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    fn clear(&self) -> bool {
        self.clear
    }

    fn attributes(&self) -> &[String] {
        &self.attributes
    }

    fn script_index(&self) -> Option<usize> {
        self.script_index
    }
}

impl StoryNode for Section {
    fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    fn clear(&self) -> bool {
        self.clear
    }

    fn attributes(&self) -> &[String] {
        &self.attributes
    }

    fn script_index(&self) -> Option<usize> {
        self.script_index
    }
}

impl Passage {
    pub fn new(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn with_attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_clear(mut self) -> Self {
        self.clear = true;
        self
    }

    pub fn with_script(mut self, index: usize) -> Self {
        self.script_index = Some(index);
        self
    }
}

impl Section {
    pub fn new(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn with_passage(mut self, name: &str, passage: Passage) -> Self {
        self.passages.insert(name.to_string(), passage);
        self
    }

    pub fn with_attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_clear(mut self) -> Self {
        self.clear = true;
        self
    }

    pub fn with_script(mut self, index: usize) -> Self {
        self.script_index = Some(index);
        self
    }

    /// Number of ordinary passages, which is what `@last` is compared against.
    ///
    /// Uses the compiler-supplied count when present, otherwise counts the
    /// passages whose names are neither empty nor `@`-prefixed.
    pub fn passage_count(&self) -> usize {
        self.passage_count.unwrap_or_else(|| {
            self.passages
                .keys()
                .filter(|name| !name.is_empty() && !name.starts_with('@'))
                .count()
        })
    }
}

/// A compiled story. Immutable once handed to a session; replaced
/// wholesale by `Session::update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Story {
    pub start: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub sections: HashMap<String, Section>,
    #[serde(skip)]
    pub scripts: Vec<ScriptFn>,
    #[serde(default, alias = "uiJsIndex", alias = "uiScriptIndex")]
    pub ui_script_index: Option<usize>,
}

impl Story {
    pub fn new(start: &str) -> Self {
        Self {
            start: start.to_string(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_section(mut self, name: &str, section: Section) -> Self {
        self.sections.insert(name.to_string(), section);
        self
    }

    /// Attach a script callback and return its index for `script_index`.
    pub fn add_script<F>(&mut self, f: F) -> usize
    where
        F: Fn(&mut ScriptContext<'_>) + 'static,
    {
        self.scripts.push(ScriptFn::new(f));
        self.scripts.len() - 1
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn master(&self) -> Option<&Section> {
        self.sections.get("")
    }

    /// Look up a passage in `section`, falling back to the master section.
    pub fn passage(&self, section: &str, passage: &str) -> Option<&Passage> {
        self.sections
            .get(section)
            .and_then(|s| s.passages.get(passage))
            .or_else(|| self.master().and_then(|m| m.passages.get(passage)))
    }

    /// Resolve the story node an output node was rendered from.
    pub fn node(&self, source: &Source) -> Option<&dyn StoryNode> {
        match source {
            Source::Master => self.master().map(|s| s as &dyn StoryNode),
            Source::Section(name) => self.section(name).map(|s| s as &dyn StoryNode),
            Source::MasterPassage(section) => self
                .section(section)
                .and_then(|s| s.passages.get(""))
                .map(|p| p as &dyn StoryNode),
            Source::Passage(section, passage) => self
                .passage(section, passage)
                .map(|p| p as &dyn StoryNode),
        }
    }

    /// Load a story from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<Story, StoryError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse a story from a RON string.
    pub fn parse_ron(input: &str) -> Result<Story, StoryError> {
        Ok(ron::from_str(input)?)
    }

    /// Load the `story` object emitted by the compiler as JSON.
    pub fn load_from_json(path: &Path) -> Result<Story, StoryError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_json(&contents)
    }

    pub fn parse_json(input: &str) -> Result<Story, StoryError> {
        Ok(serde_json::from_str(input)?)
    }
}
