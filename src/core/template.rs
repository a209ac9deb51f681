/// Template parser: turns node text into a tree of segments.
///
/// The syntax is Handlebars-style: `{{expr}}` (escaped), `{{{expr}}}` (raw),
/// `{{! comment}}`, `\{{` for literal braces, and blocks such as
/// `{{#if c}}..{{else if d}}..{{else}}..{{/if}}`, `{{#unless c}}`,
/// `{{#label "n"}}`, `{{#replace "n"}}` and plugin block helpers. Literal text
/// also carries compiled link markup: `[[section]]`, `[[text]](section)`,
/// `[passage]` and `[text](passage)`.
///
/// Parsing happens once per render, before anything is evaluated, so that
/// untaken branches are never touched.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("unclosed expression starting at byte {0}")]
    Unclosed(usize),
    #[error("empty expression")]
    Empty,
    #[error("unterminated string in '{0}'")]
    UnterminatedString(String),
    #[error("unexpected token '{token}' in '{expr}'")]
    UnexpectedToken { token: String, expr: String },
    #[error("block '{expected}' closed by '{found}'")]
    Mismatched { expected: String, found: String },
    #[error("unexpected closing tag '{0}'")]
    UnexpectedClose(String),
    #[error("'else' outside of an if block")]
    UnexpectedElse,
    #[error("unclosed block '{0}'")]
    UnclosedBlock(String),
    #[error("'{0}' needs an argument")]
    MissingArgument(String),
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A bare name: a zero-argument helper if one is registered, else an
    /// attribute read.
    Attribute(String),
    /// `seen name`: whether a section or passage has been shown.
    Seen(Box<Expr>),
    /// `at a b ..`: whether the current section is one of the names.
    At(Vec<Expr>),
    /// `embed name`: the processed text of a passage or section.
    Embed(Box<Expr>),
    Helper {
        name: String,
        args: Vec<Expr>,
        hash: Vec<(String, Expr)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMarkup {
    Section,
    Passage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Link {
        kind: LinkMarkup,
        text: String,
        target: String,
        /// The markup as written, used when a passage link has no target.
        raw: String,
    },
    Output {
        expr: Expr,
        raw: bool,
    },
    If {
        condition: Expr,
        negate: bool,
        then: Vec<Segment>,
        otherwise: Vec<Segment>,
    },
    Label {
        name: Expr,
        body: Vec<Segment>,
    },
    Replace {
        name: Expr,
        body: Vec<Segment>,
        source: String,
    },
    Block {
        helper: String,
        args: Vec<Expr>,
        hash: Vec<(String, Expr)>,
        body: Vec<Segment>,
        source: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Template {
    pub segments: Vec<Segment>,
}

enum FrameKind {
    Root,
    If { condition: Expr, negate: bool, tag: String },
    Label { name: Expr },
    Replace { name: Expr },
    Block {
        helper: String,
        args: Vec<Expr>,
        hash: Vec<(String, Expr)>,
    },
}

impl FrameKind {
    fn tag(&self) -> &str {
        match self {
            Self::Root => "",
            Self::If { tag, .. } => tag,
            Self::Label { .. } => "label",
            Self::Replace { .. } => "replace",
            Self::Block { helper, .. } => helper,
        }
    }
}

struct Frame {
    kind: FrameKind,
    then: Vec<Segment>,
    otherwise: Option<Vec<Segment>>,
    /// Opened by `{{else if}}`; closed together with its parent.
    implicit: bool,
    body_start: usize,
}

impl Frame {
    fn new(kind: FrameKind, body_start: usize) -> Self {
        Self {
            kind,
            then: Vec::new(),
            otherwise: None,
            implicit: false,
            body_start,
        }
    }

    fn current(&mut self) -> &mut Vec<Segment> {
        match &mut self.otherwise {
            Some(otherwise) => otherwise,
            None => &mut self.then,
        }
    }

    fn into_segment(self, source: &str) -> Segment {
        match self.kind {
            FrameKind::If {
                condition, negate, ..
            } => Segment::If {
                condition,
                negate,
                then: self.then,
                otherwise: self.otherwise.unwrap_or_default(),
            },
            FrameKind::Label { name } => Segment::Label {
                name,
                body: self.then,
            },
            FrameKind::Replace { name } => Segment::Replace {
                name,
                body: self.then,
                source: source.to_string(),
            },
            FrameKind::Block { helper, args, hash } => Segment::Block {
                helper,
                args,
                hash,
                body: self.then,
                source: source.to_string(),
            },
            FrameKind::Root => Segment::Literal(String::new()),
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    stack: Vec<Frame>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Template, TemplateError> {
        let mut parser = Parser {
            text,
            stack: vec![Frame::new(FrameKind::Root, 0)],
        };
        parser.run()?;
        let mut root = parser.stack.pop().ok_or(TemplateError::Empty)?;
        Ok(Template {
            segments: std::mem::take(&mut root.then),
        })
    }

    /// Whether the text contains anything beyond plain literal markup.
    pub fn is_plain(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }
}

impl<'a> Parser<'a> {
    fn top(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn push_literal(&mut self, literal: &mut String) {
        if literal.is_empty() {
            return;
        }
        let text = std::mem::take(literal);
        split_links(&text, self.top().current());
    }

    fn run(&mut self) -> Result<(), TemplateError> {
        let text = self.text;
        let bytes = text.as_bytes();
        let mut literal = String::new();
        let mut pos = 0;
        while pos < text.len() {
            let Some(offset) = text[pos..].find("{{") else {
                literal.push_str(&text[pos..]);
                break;
            };
            let start = pos + offset;
            if start > 0 && bytes[start - 1] == b'\\' {
                literal.push_str(&text[pos..start - 1]);
                literal.push_str("{{");
                pos = start + 2;
                continue;
            }
            literal.push_str(&text[pos..start]);

            let after = &text[start + 2..];
            if after.starts_with("!--") {
                let close = text[start..]
                    .find("--}}")
                    .ok_or(TemplateError::Unclosed(start))?;
                pos = start + close + 4;
                continue;
            }
            if after.starts_with('!') {
                let close = text[start..]
                    .find("}}")
                    .ok_or(TemplateError::Unclosed(start))?;
                pos = start + close + 2;
                continue;
            }

            let raw = after.starts_with('{');
            let inner_start = start + if raw { 3 } else { 2 };
            let close = find_close(text, inner_start, raw).ok_or(TemplateError::Unclosed(start))?;
            let end = close + if raw { 3 } else { 2 };
            let inner = text[inner_start..close].trim().trim_matches('~').trim();

            self.push_literal(&mut literal);
            self.tag(inner, raw, start, end)?;
            pos = end;
        }
        self.push_literal(&mut literal);

        while self.stack.len() > 1 {
            let frame = self.top();
            if frame.implicit {
                self.close_top(text.len())?;
            } else {
                return Err(TemplateError::UnclosedBlock(frame.kind.tag().to_string()));
            }
        }
        Ok(())
    }

    fn tag(&mut self, inner: &str, raw: bool, start: usize, end: usize) -> Result<(), TemplateError> {
        if let Some(open) = inner.strip_prefix('#') {
            let open = open.trim();
            let (name, rest) = split_word(open);
            let kind = match name {
                "if" | "unless" => FrameKind::If {
                    condition: parse_expression(rest)?,
                    negate: name == "unless",
                    tag: name.to_string(),
                },
                "label" | "replace" => {
                    if rest.is_empty() {
                        return Err(TemplateError::MissingArgument(name.to_string()));
                    }
                    let label = parse_expression(rest)?;
                    if name == "label" {
                        FrameKind::Label { name: label }
                    } else {
                        FrameKind::Replace { name: label }
                    }
                }
                "" => return Err(TemplateError::Empty),
                helper => {
                    let (args, hash) = parse_params(rest)?;
                    FrameKind::Block {
                        helper: helper.to_string(),
                        args,
                        hash,
                    }
                }
            };
            self.stack.push(Frame::new(kind, end));
            return Ok(());
        }

        if let Some(close) = inner.strip_prefix('/') {
            let name = close.trim();
            while self.stack.len() > 1 && self.top().implicit {
                self.close_top(start)?;
            }
            if self.stack.len() == 1 {
                return Err(TemplateError::UnexpectedClose(name.to_string()));
            }
            let expected = self.top().kind.tag().to_string();
            if expected != name {
                return Err(TemplateError::Mismatched {
                    expected,
                    found: name.to_string(),
                });
            }
            return self.close_top(start);
        }

        if inner == "else" || inner == "^" {
            let frame = self.top();
            if !matches!(frame.kind, FrameKind::If { .. }) || frame.otherwise.is_some() {
                return Err(TemplateError::UnexpectedElse);
            }
            frame.otherwise = Some(Vec::new());
            return Ok(());
        }

        if let Some(chain) = inner.strip_prefix("else ") {
            let (name, rest) = split_word(chain.trim());
            if name != "if" && name != "unless" {
                return Err(TemplateError::UnexpectedElse);
            }
            let condition = parse_expression(rest)?;
            let frame = self.top();
            if !matches!(frame.kind, FrameKind::If { .. }) || frame.otherwise.is_some() {
                return Err(TemplateError::UnexpectedElse);
            }
            frame.otherwise = Some(Vec::new());
            let mut chained = Frame::new(
                FrameKind::If {
                    condition,
                    negate: name == "unless",
                    tag: name.to_string(),
                },
                end,
            );
            chained.implicit = true;
            self.stack.push(chained);
            return Ok(());
        }

        let expr = parse_expression(inner)?;
        self.top().current().push(Segment::Output { expr, raw });
        Ok(())
    }

    fn close_top(&mut self, body_end: usize) -> Result<(), TemplateError> {
        let frame = self.stack.pop().ok_or(TemplateError::Empty)?;
        let source = self.text.get(frame.body_start..body_end).unwrap_or("");
        let segment = frame.into_segment(source);
        self.top().current().push(segment);
        Ok(())
    }
}

fn split_word(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(i) => (&text[..i], text[i..].trim()),
        None => (text, ""),
    }
}

/// Find the end of a tag opened at `from`, skipping quoted strings.
fn find_close(text: &str, from: usize, raw: bool) -> Option<usize> {
    let pattern = if raw { "}}}" } else { "}}" };
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if text[i..].starts_with(pattern) => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

fn split_links(text: &str, out: &mut Vec<Segment>) {
    let mut plain = String::new();
    let mut rest = text;
    while let Some(i) = rest.find('[') {
        plain.push_str(&rest[..i]);
        let candidate = &rest[i..];
        match parse_link(candidate) {
            Some((segment, consumed)) => {
                if !plain.is_empty() {
                    out.push(Segment::Literal(std::mem::take(&mut plain)));
                }
                out.push(segment);
                rest = &candidate[consumed..];
            }
            None => {
                plain.push('[');
                rest = &candidate[1..];
            }
        }
    }
    plain.push_str(rest);
    if !plain.is_empty() {
        out.push(Segment::Literal(plain));
    }
}

fn parse_link(s: &str) -> Option<(Segment, usize)> {
    let (kind, open, close) = if s.starts_with("[[") {
        (LinkMarkup::Section, 2, "]]")
    } else {
        (LinkMarkup::Passage, 1, "]")
    };
    let inner = &s[open..];
    let end = inner.find(close)?;
    let label = &inner[..end];
    if label.trim().is_empty() || label.contains(['[', ']', '\n']) {
        return None;
    }
    let mut consumed = open + end + close.len();
    let mut target = label;
    if let Some(explicit) = s[consumed..].strip_prefix('(') {
        let stop = explicit.find(')')?;
        if explicit[..stop].contains('\n') {
            return None;
        }
        target = &explicit[..stop];
        consumed += stop + 2;
    }
    Some((
        Segment::Link {
            kind,
            text: label.to_string(),
            target: target.trim().to_string(),
            raw: s[..consumed].to_string(),
        },
        consumed,
    ))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Ident(String),
    Open,
    Close,
    Equals,
}

fn tokenize(input: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Equals);
            }
            '"' | '\'' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    if ch == c {
                        closed = true;
                        break;
                    }
                    if ch == '\\' {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                        continue;
                    }
                    value.push(ch);
                }
                if !closed {
                    return Err(TemplateError::UnterminatedString(input.to_string()));
                }
                tokens.push(Token::Str(value));
            }
            _ => {
                let mut end = input.len();
                while let Some(&(j, ch)) = chars.peek() {
                    if ch.is_whitespace() || matches!(ch, '(' | ')' | '=' | '"' | '\'') {
                        end = j;
                        break;
                    }
                    chars.next();
                }
                let word = &input[i..end];
                match crate::core::value::parse_number(word) {
                    Some(n) if word.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.') => {
                        tokens.push(Token::Num(n))
                    }
                    _ => tokens.push(Token::Ident(word.to_string())),
                }
            }
        }
    }
    Ok(tokens)
}

enum Param {
    Positional(Expr),
    Hash(String, Expr),
}

struct ExprParser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn unexpected(&self, token: &Token) -> TemplateError {
        TemplateError::UnexpectedToken {
            token: format!("{token:?}"),
            expr: self.source.to_string(),
        }
    }

    fn atom(&mut self) -> Result<Expr, TemplateError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(TemplateError::Empty)?;
        self.pos += 1;
        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Num(n) => Ok(Expr::Literal(crate::core::value::number(n))),
            Token::Ident(word) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Attribute(word),
            }),
            Token::Open => {
                let params = self.sequence(true)?;
                match self.tokens.get(self.pos) {
                    Some(Token::Close) => self.pos += 1,
                    _ => {
                        return Err(TemplateError::UnexpectedToken {
                            token: "end of expression".to_string(),
                            expr: self.source.to_string(),
                        })
                    }
                }
                build(params, self.source)
            }
            other => Err(self.unexpected(&other)),
        }
    }

    fn sequence(&mut self, nested: bool) -> Result<Vec<Param>, TemplateError> {
        let mut params = Vec::new();
        while let Some(token) = self.tokens.get(self.pos) {
            match token {
                Token::Close if nested => break,
                Token::Close | Token::Equals => return Err(self.unexpected(&token.clone())),
                Token::Ident(key) if self.tokens.get(self.pos + 1) == Some(&Token::Equals) => {
                    let key = key.clone();
                    self.pos += 2;
                    let value = self.atom()?;
                    params.push(Param::Hash(key, value));
                }
                _ => {
                    let expr = self.atom()?;
                    params.push(Param::Positional(expr));
                }
            }
        }
        Ok(params)
    }
}

fn split_params(params: Vec<Param>) -> (Vec<Expr>, Vec<(String, Expr)>) {
    let mut args = Vec::new();
    let mut hash = Vec::new();
    for param in params {
        match param {
            Param::Positional(expr) => args.push(expr),
            Param::Hash(key, expr) => hash.push((key, expr)),
        }
    }
    (args, hash)
}

fn build(params: Vec<Param>, source: &str) -> Result<Expr, TemplateError> {
    let (mut args, hash) = split_params(params);
    if args.is_empty() {
        return Err(TemplateError::Empty);
    }
    if args.len() == 1 && hash.is_empty() {
        return Ok(args.remove(0));
    }
    let name = match args.remove(0) {
        Expr::Attribute(name) => name,
        other => {
            return Err(TemplateError::UnexpectedToken {
                token: format!("{other:?}"),
                expr: source.to_string(),
            })
        }
    };
    Ok(match name.as_str() {
        "seen" => Expr::Seen(single("seen", &mut args)?),
        "embed" => Expr::Embed(single("embed", &mut args)?),
        "at" if !args.is_empty() => Expr::At(args),
        _ => Expr::Helper { name, args, hash },
    })
}

fn single(keyword: &str, args: &mut Vec<Expr>) -> Result<Box<Expr>, TemplateError> {
    if args.is_empty() {
        Err(TemplateError::MissingArgument(keyword.to_string()))
    } else {
        Ok(Box::new(args.remove(0)))
    }
}

/// Parse a full expression such as `x`, `"text"`, `inc "score" 2` or
/// `eq (get "a") 1`.
pub fn parse_expression(input: &str) -> Result<Expr, TemplateError> {
    let mut parser = ExprParser {
        source: input,
        tokens: tokenize(input)?,
        pos: 0,
    };
    let params = parser.sequence(false)?;
    build(params, input)
}

/// Parse the parameters of a block helper: positional args and `key=value` pairs.
pub fn parse_params(input: &str) -> Result<(Vec<Expr>, Vec<(String, Expr)>), TemplateError> {
    let mut parser = ExprParser {
        source: input,
        tokens: tokenize(input)?,
        pos: 0,
    };
    let params = parser.sequence(false)?;
    Ok(split_params(params))
}
