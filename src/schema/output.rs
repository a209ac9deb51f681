/// The rendered output tree.
///
/// Sections and passages are written into an explicit in-memory tree that the
/// host projects onto its surface (`Output::to_html` for a browser page, the
/// plain-text accessors for a terminal). The tree carries everything `go_back`
/// and `update` need: node sources, undo payloads and clear boundaries.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::core::history::UndoLog;

/// Identifies a link, input or span inside the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The story node an output node was rendered from.
///
/// Serialized as the path strings `[[]]`, `[[s]]`, `[[s]][]` and `[[s]][p]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Master,
    Section(String),
    MasterPassage(String),
    Passage(String, String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "[[]]"),
            Self::Section(s) => write!(f, "[[{s}]]"),
            Self::MasterPassage(s) => write!(f, "[[{s}]][]"),
            Self::Passage(s, p) => write!(f, "[[{s}]][{p}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSourceError(pub String);

impl fmt::Display for ParseSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid source path: {}", self.0)
    }
}

impl std::error::Error for ParseSourceError {}

impl FromStr for Source {
    type Err = ParseSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSourceError(s.to_string());
        let rest = s.strip_prefix("[[").ok_or_else(err)?;
        let close = rest.find("]]").ok_or_else(err)?;
        let section = &rest[..close];
        let tail = &rest[close + 2..];
        if tail.is_empty() {
            return Ok(if section.is_empty() {
                Self::Master
            } else {
                Self::Section(section.to_string())
            });
        }
        let passage = tail
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .ok_or_else(err)?;
        if passage.is_empty() {
            Ok(Self::MasterPassage(section.to_string()))
        } else {
            Ok(Self::Passage(section.to_string(), passage.to_string()))
        }
    }
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What a link does when clicked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkKind {
    /// Navigates to a section. `target` may carry comma-separated side effects.
    Section { target: String },
    /// Shows a passage in place.
    Passage { target: String },
    /// Dispatched to a registered link handler.
    Handler {
        handler: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
}

impl LinkKind {
    pub fn type_name(&self) -> &str {
        match self {
            Self::Section { .. } => "section",
            Self::Passage { .. } => "passage",
            Self::Handler { handler, .. } => handler,
        }
    }

    pub fn is_navigation(&self) -> bool {
        !matches!(self, Self::Handler { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub id: Option<ElementId>,
    pub kind: LinkKind,
    pub text: String,
    /// Attribute lines applied when the link is clicked.
    #[serde(default)]
    pub set: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Set while the section's inputs are invalid.
    #[serde(default)]
    pub validation_disabled: bool,
}

impl Link {
    pub fn new(kind: LinkKind, text: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            text: text.into(),
            set: Vec::new(),
            disabled: false,
            validation_disabled: false,
        }
    }

    pub fn section(target: &str, text: impl Into<String>) -> Self {
        Self::new(
            LinkKind::Section {
                target: target.to_string(),
            },
            text,
        )
    }

    pub fn passage(target: &str, text: impl Into<String>) -> Self {
        Self::new(
            LinkKind::Passage {
                target: target.to_string(),
            },
            text,
        )
    }

    /// The link's destination without any side effects.
    pub fn destination(&self) -> Option<&str> {
        match &self.kind {
            LinkKind::Section { target } | LinkKind::Passage { target } => {
                target.split(',').next().map(str::trim)
            }
            LinkKind::Handler { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    Text,
    Number,
    Email,
    TextArea,
}

/// HTML5-style validity constraints on an input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    #[serde(default)]
    pub id: Option<ElementId>,
    /// Attribute the value is written to when the section is left.
    pub attribute: String,
    pub kind: InputKind,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub invalid: bool,
}

/// A plugin-defined element such as a live binding or an animation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    #[serde(default)]
    pub id: Option<ElementId>,
    pub class: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub content: Vec<Fragment>,
}

impl Span {
    pub fn new(class: &str) -> Self {
        Self {
            id: None,
            class: class.to_string(),
            data: Map::new(),
            content: Vec::new(),
        }
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Fragment {
    /// Literal template text, written as-is.
    Markup(String),
    /// A value produced by an expression, escaped on output.
    Text(String),
    Link(Link),
    Input(InputField),
    Label { name: String, content: Vec<Fragment> },
    Span(Span),
}

impl Fragment {
    pub fn children(&self) -> Option<&[Fragment]> {
        match self {
            Self::Label { content, .. } | Self::Span(Span { content, .. }) => Some(content),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Fragment>> {
        match self {
            Self::Label { content, .. } | Self::Span(Span { content, .. }) => Some(content),
            _ => None,
        }
    }
}

/// One rendered story node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputNode {
    pub source: Source,
    pub content: Vec<Fragment>,
}

impl OutputNode {
    pub fn new(source: Source, content: Vec<Fragment>) -> Self {
        Self { source, content }
    }

    /// Visible text with markup stripped.
    pub fn text(&self) -> String {
        let mut out = String::new();
        plain_text(&self.content, &mut out);
        out.trim().to_string()
    }
}

/// The block written by one passage click.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputPassage {
    pub passage: String,
    /// The block was opened by a `@clear`.
    #[serde(default)]
    pub clears: bool,
    #[serde(default)]
    pub undo: UndoLog,
    #[serde(default)]
    pub content: Vec<OutputNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSection {
    pub id: u64,
    pub section: Option<String>,
    /// Opened by a passage-level `@clear` to hold the passage block.
    #[serde(default)]
    pub placeholder: bool,
    /// Rendering this section cleared the screen.
    #[serde(default)]
    pub clears: bool,
    #[serde(default)]
    pub undo: UndoLog,
    #[serde(default)]
    pub content: Vec<OutputNode>,
    #[serde(default)]
    pub passages: Vec<OutputPassage>,
}

impl OutputSection {
    pub fn new(id: u64, section: &str) -> Self {
        Self {
            id,
            section: Some(section.to_string()),
            ..Self::default()
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &OutputNode> {
        self.content
            .iter()
            .chain(self.passages.iter().flat_map(|p| p.content.iter()))
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut OutputNode> {
        self.content
            .iter_mut()
            .chain(self.passages.iter_mut().flat_map(|p| p.content.iter_mut()))
    }

    pub fn for_each_fragment(&self, f: &mut dyn FnMut(&Fragment)) {
        for node in self.nodes() {
            visit(&node.content, f);
        }
    }

    pub fn for_each_fragment_mut(&mut self, f: &mut dyn FnMut(&mut Fragment)) {
        for node in self.nodes_mut() {
            visit_mut(&mut node.content, f);
        }
    }

    pub fn links(&self) -> Vec<&Link> {
        let mut links = Vec::new();
        for node in self.nodes() {
            collect_links(&node.content, &mut links);
        }
        links
    }

    pub fn text(&self) -> String {
        self.nodes()
            .map(OutputNode::text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Output hidden by a `@clear`, restored verbatim by `go_back`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearedOutput {
    pub sections: Vec<OutputSection>,
}

/// Location of a written node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePath {
    pub section: usize,
    pub passage: Option<usize>,
    pub node: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub sections: Vec<OutputSection>,
    #[serde(default)]
    pub clear_stack: Vec<ClearedOutput>,
    #[serde(default)]
    pub next_element_id: u64,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty() && self.clear_stack.is_empty()
    }

    /// The topmost, still-open output section.
    pub fn current(&self) -> Option<&OutputSection> {
        self.sections.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut OutputSection> {
        self.sections.last_mut()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.sections.len().checked_sub(1)
    }

    /// Section nodes plus passage nodes plus clear-stack depth.
    pub fn history_depth(&self) -> usize {
        let sections = self.sections.iter().filter(|s| !s.placeholder).count();
        let passages: usize = self.sections.iter().map(|s| s.passages.len()).sum();
        sections + passages + self.clear_stack.len()
    }

    pub fn push_section(&mut self, section: OutputSection) {
        self.sections.push(section);
    }

    /// Open a new passage block in the current section.
    pub fn open_passage(&mut self, passage: &str, clears: bool) {
        if let Some(section) = self.sections.last_mut() {
            section.passages.push(OutputPassage {
                passage: passage.to_string(),
                clears,
                ..OutputPassage::default()
            });
        }
    }

    /// Hide everything currently shown. Returns whether anything was hidden.
    pub fn clear_screen(&mut self) -> bool {
        if self.sections.is_empty() {
            return false;
        }
        let sections = std::mem::take(&mut self.sections);
        self.clear_stack.push(ClearedOutput { sections });
        true
    }

    /// Bring back the most recently hidden output in front of what is shown.
    pub fn restore_cleared(&mut self) -> bool {
        match self.clear_stack.pop() {
            Some(mut cleared) => {
                cleared.sections.append(&mut self.sections);
                self.sections = cleared.sections;
                true
            }
            None => false,
        }
    }

    /// Append a node to the current section, or to its latest passage block.
    pub fn append_node(&mut self, node: OutputNode, into_passage: bool) -> Option<NodePath> {
        let section_index = self.current_index()?;
        let section = &mut self.sections[section_index];
        if into_passage {
            let passage_index = section.passages.len().checked_sub(1)?;
            let passage = &mut section.passages[passage_index];
            passage.content.push(node);
            Some(NodePath {
                section: section_index,
                passage: Some(passage_index),
                node: passage.content.len() - 1,
            })
        } else {
            section.content.push(node);
            Some(NodePath {
                section: section_index,
                passage: None,
                node: section.content.len() - 1,
            })
        }
    }

    pub fn node(&self, path: NodePath) -> Option<&OutputNode> {
        let section = self.sections.get(path.section)?;
        match path.passage {
            Some(p) => section.passages.get(p)?.content.get(path.node),
            None => section.content.get(path.node),
        }
    }

    pub fn node_mut(&mut self, path: NodePath) -> Option<&mut OutputNode> {
        let section = self.sections.get_mut(path.section)?;
        match path.passage {
            Some(p) => section.passages.get_mut(p)?.content.get_mut(path.node),
            None => section.content.get_mut(path.node),
        }
    }

    /// Give every link, input and span in `fragments` that lacks one a fresh id.
    pub fn assign_ids(&mut self, fragments: &mut [Fragment]) {
        assign_fragment_ids(fragments, &mut self.next_element_id);
    }

    /// Assign ids to anything in the live output that lacks one.
    pub fn adopt_all(&mut self) {
        let mut next = self.next_element_id;
        for section in &mut self.sections {
            for node in section.nodes_mut() {
                assign_fragment_ids(&mut node.content, &mut next);
            }
        }
        self.next_element_id = next;
    }

    /// Visit every fragment in the live output.
    pub fn for_each_fragment_mut(&mut self, f: &mut dyn FnMut(&mut Fragment)) {
        for section in &mut self.sections {
            section.for_each_fragment_mut(f);
        }
    }

    /// Find a link in the live output, with the index of its section.
    pub fn find_link(&self, id: ElementId) -> Option<(usize, &Link)> {
        self.sections.iter().enumerate().find_map(|(index, section)| {
            section
                .links()
                .into_iter()
                .find(|link| link.id == Some(id))
                .map(|link| (index, link))
        })
    }

    /// Find a link anywhere, including output hidden by a clear.
    pub fn link_mut(&mut self, id: ElementId) -> Option<&mut Link> {
        let cleared = self
            .clear_stack
            .iter_mut()
            .flat_map(|c| c.sections.iter_mut());
        for section in self.sections.iter_mut().chain(cleared) {
            for node in section.nodes_mut() {
                if let Some(link) = find_link_mut(&mut node.content, id) {
                    return Some(link);
                }
            }
        }
        None
    }

    /// The content of the first label called `name` in the live output.
    pub fn label_mut(&mut self, name: &str) -> Option<&mut Vec<Fragment>> {
        for section in &mut self.sections {
            for node in section.nodes_mut() {
                if let Some(content) = find_label_mut(&mut node.content, name) {
                    return Some(content);
                }
            }
        }
        None
    }

    pub fn has_label(&self, name: &str) -> bool {
        let mut found = false;
        for section in &self.sections {
            section.for_each_fragment(&mut |fragment| {
                if matches!(fragment, Fragment::Label { name: n, .. } if n == name) {
                    found = true;
                }
            });
        }
        found
    }

    pub fn input_mut(&mut self, id: ElementId) -> Option<&mut InputField> {
        for section in &mut self.sections {
            for node in section.nodes_mut() {
                if let Some(input) = find_input_mut(&mut node.content, id) {
                    return Some(input);
                }
            }
        }
        None
    }

    pub fn span_mut(&mut self, id: ElementId) -> Option<&mut Span> {
        for section in &mut self.sections {
            for node in section.nodes_mut() {
                if let Some(span) = find_span_mut(&mut node.content, id) {
                    return Some(span);
                }
            }
        }
        None
    }

    /// Visible text of the live output, one line per node.
    pub fn text(&self) -> String {
        self.sections
            .iter()
            .map(OutputSection::text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Project the live output to HTML.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            write_section_html(section, &mut out);
        }
        out
    }
}

fn visit(fragments: &[Fragment], f: &mut dyn FnMut(&Fragment)) {
    for fragment in fragments {
        f(fragment);
        if let Some(children) = fragment.children() {
            visit(children, f);
        }
    }
}

fn visit_mut(fragments: &mut [Fragment], f: &mut dyn FnMut(&mut Fragment)) {
    for fragment in fragments.iter_mut() {
        f(fragment);
        if let Some(children) = fragment.children_mut() {
            visit_mut(children, f);
        }
    }
}

fn collect_links<'a>(fragments: &'a [Fragment], links: &mut Vec<&'a Link>) {
    for fragment in fragments {
        match fragment {
            Fragment::Link(link) => links.push(link),
            other => {
                if let Some(children) = other.children() {
                    collect_links(children, links);
                }
            }
        }
    }
}

fn assign_fragment_ids(fragments: &mut [Fragment], next: &mut u64) {
    let mut fresh = |id: &mut Option<ElementId>| {
        if id.is_none() {
            *next += 1;
            *id = Some(ElementId(*next));
        }
    };
    visit_mut(fragments, &mut |fragment| match fragment {
        Fragment::Link(link) => fresh(&mut link.id),
        Fragment::Input(input) => fresh(&mut input.id),
        Fragment::Span(span) => fresh(&mut span.id),
        _ => {}
    });
}

fn find_link_mut(fragments: &mut [Fragment], id: ElementId) -> Option<&mut Link> {
    for fragment in fragments.iter_mut() {
        match fragment {
            Fragment::Link(link) if link.id == Some(id) => return Some(link),
            Fragment::Label { content, .. } | Fragment::Span(Span { content, .. }) => {
                if let Some(link) = find_link_mut(content, id) {
                    return Some(link);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_label_mut<'a>(fragments: &'a mut [Fragment], name: &str) -> Option<&'a mut Vec<Fragment>> {
    for fragment in fragments.iter_mut() {
        match fragment {
            Fragment::Label { name: n, content } => {
                if n.as_str() == name {
                    return Some(content);
                }
                if let Some(found) = find_label_mut(content, name) {
                    return Some(found);
                }
            }
            Fragment::Span(Span { content, .. }) => {
                if let Some(found) = find_label_mut(content, name) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_input_mut(fragments: &mut [Fragment], id: ElementId) -> Option<&mut InputField> {
    for fragment in fragments.iter_mut() {
        match fragment {
            Fragment::Input(input) if input.id == Some(id) => return Some(input),
            Fragment::Label { content, .. } | Fragment::Span(Span { content, .. }) => {
                if let Some(input) = find_input_mut(content, id) {
                    return Some(input);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_span_mut(fragments: &mut [Fragment], id: ElementId) -> Option<&mut Span> {
    for fragment in fragments.iter_mut() {
        match fragment {
            Fragment::Span(span) => {
                if span.id == Some(id) {
                    return Some(span);
                }
                if let Some(found) = find_span_mut(&mut span.content, id) {
                    return Some(found);
                }
            }
            Fragment::Label { content, .. } => {
                if let Some(found) = find_span_mut(content, id) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

fn plain_text(fragments: &[Fragment], out: &mut String) {
    for fragment in fragments {
        match fragment {
            Fragment::Markup(markup) => out.push_str(&strip_tags(markup)),
            Fragment::Text(text) => out.push_str(text),
            Fragment::Link(link) => out.push_str(&strip_tags(&link.text)),
            Fragment::Input(input) => out.push_str(&input.value),
            Fragment::Label { content, .. } | Fragment::Span(Span { content, .. }) => {
                plain_text(content, out)
            }
        }
    }
}

fn strip_tags(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut in_tag = false;
    for ch in markup.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

pub(crate) fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// HTML for a run of fragments, used when rendered output becomes a value.
pub fn fragments_html(fragments: &[Fragment]) -> String {
    let mut out = String::new();
    write_fragments_html(fragments, &mut out);
    out
}

fn write_undo_attr(undo: &UndoLog, out: &mut String) {
    if !undo.is_empty() {
        if let Ok(json) = serde_json::to_string(undo) {
            out.push_str(&format!(" data-undo=\"{}\"", escape_html(&json)));
        }
    }
}

fn write_data_attrs(data: &Map<String, Value>, out: &mut String) {
    for (key, value) in data {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.push_str(&format!(" data-{}=\"{}\"", escape_html(key), escape_html(&text)));
    }
}

fn write_section_html(section: &OutputSection, out: &mut String) {
    out.push_str(&format!(
        "<div class=\"squiffy-output-section\" id=\"squiffy-section-{}\"",
        section.id
    ));
    if let Some(name) = &section.section {
        out.push_str(&format!(" data-section=\"{}\"", escape_html(name)));
    }
    if section.clears {
        out.push_str(" data-clear=\"true\"");
    }
    write_undo_attr(&section.undo, out);
    out.push('>');
    out.push_str("<div class=\"squiffy-output-block\">");
    for node in &section.content {
        write_node_html(node, out);
    }
    out.push_str("</div>");
    for passage in &section.passages {
        out.push_str(&format!(
            "<div class=\"squiffy-output-block squiffy-output-passage\" data-passage=\"{}\"",
            escape_html(&passage.passage)
        ));
        if passage.clears {
            out.push_str(" data-clear=\"true\"");
        }
        write_undo_attr(&passage.undo, out);
        out.push('>');
        for node in &passage.content {
            write_node_html(node, out);
        }
        out.push_str("</div>");
    }
    out.push_str("</div>");
}

fn write_node_html(node: &OutputNode, out: &mut String) {
    out.push_str(&format!(
        "<div data-source=\"{}\">",
        escape_html(&node.source.to_string())
    ));
    write_fragments_html(&node.content, out);
    out.push_str("</div>");
}

fn write_fragments_html(fragments: &[Fragment], out: &mut String) {
    for fragment in fragments {
        match fragment {
            Fragment::Markup(markup) => out.push_str(markup),
            Fragment::Text(text) => out.push_str(&escape_html(text)),
            Fragment::Link(link) => write_link_html(link, out),
            Fragment::Input(input) => write_input_html(input, out),
            Fragment::Label { name, content } => {
                out.push_str(&format!(
                    "<span class=\"squiffy-label-{}\">",
                    escape_html(name)
                ));
                write_fragments_html(content, out);
                out.push_str("</span>");
            }
            Fragment::Span(span) => {
                out.push_str(&format!("<span class=\"{}\"", escape_html(&span.class)));
                if let Some(id) = span.id {
                    out.push_str(&format!(" data-id=\"{id}\""));
                }
                write_data_attrs(&span.data, out);
                out.push('>');
                write_fragments_html(&span.content, out);
                out.push_str("</span>");
            }
        }
    }
}

fn write_link_html(link: &Link, out: &mut String) {
    let mut class = String::from("squiffy-link");
    match &link.kind {
        LinkKind::Section { .. } => class.push_str(" link-section"),
        LinkKind::Passage { .. } => class.push_str(" link-passage"),
        LinkKind::Handler { .. } => {}
    }
    if link.disabled {
        class.push_str(" disabled");
    }
    if link.validation_disabled {
        class.push_str(" validation-disabled");
    }
    out.push_str(&format!("<a class=\"{class}\""));
    match &link.kind {
        LinkKind::Section { target } => {
            out.push_str(&format!(" data-section=\"{}\"", escape_html(target)))
        }
        LinkKind::Passage { target } => {
            out.push_str(&format!(" data-passage=\"{}\"", escape_html(target)))
        }
        LinkKind::Handler { handler, data } => {
            out.push_str(&format!(" data-handler=\"{}\"", escape_html(handler)));
            write_data_attrs(data, out);
        }
    }
    if !link.set.is_empty() {
        if let Ok(json) = serde_json::to_string(&link.set) {
            out.push_str(&format!(" data-set=\"{}\"", escape_html(&json)));
        }
    }
    if let Some(id) = link.id {
        out.push_str(&format!(" data-id=\"{id}\""));
    }
    if link.validation_disabled {
        out.push_str(" aria-disabled=\"true\"");
    }
    let tabindex = if link.disabled { -1 } else { 0 };
    out.push_str(&format!(" role=\"link\" tabindex=\"{tabindex}\">"));
    out.push_str(&link.text);
    out.push_str("</a>");
}

fn write_input_html(input: &InputField, out: &mut String) {
    let mut attrs = format!(" data-attribute=\"{}\"", escape_html(&input.attribute));
    if let Some(id) = input.id {
        attrs.push_str(&format!(" data-id=\"{id}\""));
    }
    let c = &input.constraints;
    if c.required {
        attrs.push_str(" required");
    }
    if let Some(n) = c.min_length {
        attrs.push_str(&format!(" minlength=\"{n}\""));
    }
    if let Some(n) = c.max_length {
        attrs.push_str(&format!(" maxlength=\"{n}\""));
    }
    if let Some(p) = &c.pattern {
        attrs.push_str(&format!(" pattern=\"{}\"", escape_html(p)));
    }
    if let Some(n) = c.min {
        attrs.push_str(&format!(" min=\"{n}\""));
    }
    if let Some(n) = c.max {
        attrs.push_str(&format!(" max=\"{n}\""));
    }
    if input.invalid {
        attrs.push_str(" class=\"squiffy-invalid\"");
    }
    if input.disabled {
        attrs.push_str(" disabled");
    }
    match input.kind {
        InputKind::TextArea => out.push_str(&format!(
            "<textarea{attrs}>{}</textarea>",
            escape_html(&input.value)
        )),
        kind => {
            let ty = match kind {
                InputKind::Number => "number",
                InputKind::Email => "email",
                _ => "text",
            };
            out.push_str(&format!(
                "<input type=\"{ty}\"{attrs} value=\"{}\">",
                escape_html(&input.value)
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(source: Source, text: &str) -> OutputNode {
        OutputNode::new(source, vec![Fragment::Markup(text.to_string())])
    }

    #[test]
    fn source_paths_round_trip_through_strings() {
        let cases = [
            (Source::Master, "[[]]"),
            (Source::Section("intro".into()), "[[intro]]"),
            (Source::MasterPassage(String::new()), "[[]][]"),
            (Source::MasterPassage("intro".into()), "[[intro]][]"),
            (Source::Passage("intro".into(), "look".into()), "[[intro]][look]"),
        ];
        for (source, text) in cases {
            assert_eq!(source.to_string(), text);
            assert_eq!(text.parse::<Source>().unwrap(), source);
        }
        assert!("intro".parse::<Source>().is_err());
        assert!("[[a]]x".parse::<Source>().is_err());
    }

    #[test]
    fn history_depth_counts_sections_passages_and_clears() {
        let mut output = Output::new();
        assert_eq!(output.history_depth(), 0);
        output.push_section(OutputSection::new(1, "a"));
        assert_eq!(output.history_depth(), 1);
        output.open_passage("p", false);
        assert_eq!(output.history_depth(), 2);
        assert!(output.clear_screen());
        let mut placeholder = OutputSection::new(2, "a");
        placeholder.placeholder = true;
        output.push_section(placeholder);
        output.open_passage("q", true);
        // placeholder itself does not count
        assert_eq!(output.history_depth(), 2);
    }

    #[test]
    fn clear_and_restore_preserve_content() {
        let mut output = Output::new();
        output.push_section(OutputSection::new(1, "a"));
        output.append_node(node(Source::Section("a".into()), "<p>first</p>"), false);
        let before = output.sections.clone();

        assert!(output.clear_screen());
        assert!(output.sections.is_empty());
        output.push_section(OutputSection::new(2, "b"));
        output.sections.pop();
        assert!(output.restore_cleared());
        assert_eq!(output.sections, before);
        assert!(!output.restore_cleared());
    }

    #[test]
    fn append_into_passage_requires_open_block() {
        let mut output = Output::new();
        output.push_section(OutputSection::new(1, "a"));
        assert!(output
            .append_node(node(Source::Passage("a".into(), "p".into()), "x"), true)
            .is_none());
        output.open_passage("p", false);
        let path = output
            .append_node(node(Source::Passage("a".into(), "p".into()), "x"), true)
            .unwrap();
        assert_eq!(path.passage, Some(0));
        assert_eq!(output.node(path).unwrap().text(), "x");
    }

    #[test]
    fn ids_are_assigned_once() {
        let mut output = Output::new();
        let mut fragments = vec![
            Fragment::Link(Link::section("b", "go")),
            Fragment::Label {
                name: "l".into(),
                content: vec![Fragment::Link(Link::passage("p", "look"))],
            },
        ];
        output.assign_ids(&mut fragments);
        output.assign_ids(&mut fragments);
        assert_eq!(output.next_element_id, 2);
        match &fragments[1] {
            Fragment::Label { content, .. } => match &content[0] {
                Fragment::Link(link) => assert_eq!(link.id, Some(ElementId(2))),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn link_lookup_reaches_cleared_output() {
        let mut output = Output::new();
        output.push_section(OutputSection::new(1, "a"));
        let mut link = Link::passage("p", "look");
        link.id = Some(ElementId(7));
        output.append_node(
            OutputNode::new(Source::Section("a".into()), vec![Fragment::Link(link)]),
            false,
        );
        assert_eq!(output.find_link(ElementId(7)).map(|(i, _)| i), Some(0));
        output.clear_screen();
        assert!(output.find_link(ElementId(7)).is_none());
        output.link_mut(ElementId(7)).unwrap().disabled = true;
        output.restore_cleared();
        assert!(output.find_link(ElementId(7)).unwrap().1.disabled);
    }

    #[test]
    fn html_projection_marks_links_and_escapes_text() {
        let mut output = Output::new();
        let mut section = OutputSection::new(3, "a");
        section.clears = true;
        output.push_section(section);
        let mut link = Link::section("b", "Go on");
        link.disabled = true;
        output.append_node(
            OutputNode::new(
                Source::Section("a".into()),
                vec![
                    Fragment::Markup("<p>".into()),
                    Fragment::Text("1 < 2".into()),
                    Fragment::Link(link),
                    Fragment::Markup("</p>".into()),
                ],
            ),
            false,
        );
        output.adopt_all();
        let html = output.to_html();
        assert!(html.contains("id=\"squiffy-section-3\""));
        assert!(html.contains("data-clear=\"true\""));
        assert!(html.contains("data-source=\"[[a]]\""));
        assert!(html.contains("1 &lt; 2"));
        assert!(html.contains("class=\"squiffy-link link-section disabled\""));
        assert!(html.contains("tabindex=\"-1\""));
        assert_eq!(output.text(), "1 < 2Go on");
    }

    #[test]
    fn output_serializes_with_source_strings() {
        let mut output = Output::new();
        output.push_section(OutputSection::new(1, ""));
        output.append_node(node(Source::Master, "m"), false);
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["sections"][0]["content"][0]["source"], "[[]]");
        let back: Output = serde_json::from_value(json).unwrap();
        assert_eq!(back, output);
    }
}
