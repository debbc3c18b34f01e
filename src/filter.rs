//! LDAP search filters: tree model, string parser and evaluation.
//!
//! Besides the RFC 4515 filter components, the tree carries two internal
//! scope clauses (`DnOneLevel`, `DnSubtree`) which only the candidate set
//! builder produces. They have no string syntax of their own.

use crate::matching::ValueOrdering;
use crate::types::{attr, Dn, Entry};
use std::fmt;
use thiserror::Error;

/// Filter string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterParseError {
    #[error("Unexpected end of filter")]
    UnexpectedEnd,

    #[error("Unexpected character {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },

    #[error("Empty attribute description at offset {0}")]
    EmptyAttribute(usize),

    #[error("Invalid escape at offset {0}")]
    InvalidEscape(usize),

    #[error("Unsupported filter component: {0}")]
    Unsupported(String),

    #[error("Trailing input at offset {0}")]
    Trailing(usize),
}

/// A search filter tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attr: String, value: String },
    GreaterOrEqual { attr: String, value: String },
    LessOrEqual { attr: String, value: String },
    Present(String),
    Substrings {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        final_: Option<String>,
    },
    /// Entries whose parent is the given DN.
    DnOneLevel(Dn),
    /// Entries at or below the given DN.
    DnSubtree(Dn),
}

/// Three-valued filter evaluation result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterResult {
    True,
    False,
    Undefined,
}

impl FilterResult {
    pub fn is_true(self) -> bool {
        self == FilterResult::True
    }

    fn not(self) -> Self {
        match self {
            FilterResult::True => FilterResult::False,
            FilterResult::False => FilterResult::True,
            FilterResult::Undefined => FilterResult::Undefined,
        }
    }
}

impl Filter {
    pub fn parse(input: &str) -> Result<Filter, FilterParseError> {
        let trimmed = input.trim();
        if !trimmed.starts_with('(') {
            let wrapped = format!("({})", trimmed);
            return Parser::new(&wrapped).parse_all();
        }
        Parser::new(trimmed).parse_all()
    }

    pub fn equality(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equality {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn present(attr: impl Into<String>) -> Self {
        Filter::Present(attr.into())
    }

    /// Nesting depth: 1 for a leaf, plus one for every AND/OR level on the
    /// deepest path. NOT is not descended into by index evaluation, so it
    /// counts as a leaf.
    pub fn nesting_depth(&self) -> usize {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                1 + children.iter().map(Filter::nesting_depth).max().unwrap_or(0)
            }
            _ => 1,
        }
    }

    /// True if this filter matches every entry by virtue of an
    /// `(objectClass=*)` test at the top level (directly or as a disjunct).
    pub fn tests_object_class_presence(&self) -> bool {
        match self {
            Filter::Present(a) => a.eq_ignore_ascii_case(attr::OBJECT_CLASS),
            Filter::Or(children) => children.iter().any(Filter::tests_object_class_presence),
            _ => false,
        }
    }

    /// Evaluate the filter against an entry.
    ///
    /// Comparison failures never propagate; they make the affected
    /// component `Undefined`.
    pub fn evaluate(&self, entry: &Entry, ordering: &dyn ValueOrdering) -> FilterResult {
        match self {
            Filter::And(children) => {
                let mut result = FilterResult::True;
                for child in children {
                    match child.evaluate(entry, ordering) {
                        FilterResult::False => return FilterResult::False,
                        FilterResult::Undefined => result = FilterResult::Undefined,
                        FilterResult::True => {}
                    }
                }
                result
            }
            Filter::Or(children) => {
                let mut result = FilterResult::False;
                for child in children {
                    match child.evaluate(entry, ordering) {
                        FilterResult::True => return FilterResult::True,
                        FilterResult::Undefined => result = FilterResult::Undefined,
                        FilterResult::False => {}
                    }
                }
                result
            }
            Filter::Not(inner) => inner.evaluate(entry, ordering).not(),
            Filter::Equality { attr, value } => any_value(entry, attr, |v| {
                ordering.equal(attr, v, value)
            }),
            Filter::GreaterOrEqual { attr, value } => any_value(entry, attr, |v| {
                ordering.compare(attr, v, value).map(|o| o.is_ge())
            }),
            Filter::LessOrEqual { attr, value } => any_value(entry, attr, |v| {
                ordering.compare(attr, v, value).map(|o| o.is_le())
            }),
            Filter::Present(attr) => {
                if entry.values(attr).is_empty() {
                    FilterResult::False
                } else {
                    FilterResult::True
                }
            }
            Filter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => any_value(entry, attr, |v| {
                ordering.substrings(attr, v, initial.as_deref(), any, final_.as_deref())
            }),
            Filter::DnOneLevel(base) => bool_result(entry.dn.is_child_of(base)),
            Filter::DnSubtree(base) => bool_result(entry.dn.is_descendant_or_self(base)),
        }
    }
}

fn bool_result(b: bool) -> FilterResult {
    if b {
        FilterResult::True
    } else {
        FilterResult::False
    }
}

fn any_value<F>(entry: &Entry, attr: &str, mut test: F) -> FilterResult
where
    F: FnMut(&str) -> Result<bool, crate::matching::MatchError>,
{
    let mut result = FilterResult::False;
    for value in entry.values(attr) {
        match test(value) {
            Ok(true) => return FilterResult::True,
            Ok(false) => {}
            Err(e) => {
                tracing::trace!(attr, error = %e, "filter comparison undefined");
                result = FilterResult::Undefined;
            }
        }
    }
    result
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                f.write_str("(&")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                f.write_str(")")
            }
            Filter::Or(children) => {
                f.write_str("(|")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality { attr, value } => write!(f, "({}={})", attr, escape(value)),
            Filter::GreaterOrEqual { attr, value } => write!(f, "({}>={})", attr, escape(value)),
            Filter::LessOrEqual { attr, value } => write!(f, "({}<={})", attr, escape(value)),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    f.write_str(&escape(initial))?;
                }
                f.write_str("*")?;
                for piece in any {
                    write!(f, "{}*", escape(piece))?;
                }
                if let Some(final_) = final_ {
                    f.write_str(&escape(final_))?;
                }
                f.write_str(")")
            }
            Filter::DnOneLevel(dn) => write!(f, "(entryDN:dnOneLevelMatch:={})", escape(dn.raw())),
            Filter::DnSubtree(dn) => write!(f, "(entryDN:dnSubtreeMatch:={})", escape(dn.raw())),
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_all(mut self) -> Result<Filter, FilterParseError> {
        let filter = self.parse_filter()?;
        self.skip_spaces();
        if self.pos < self.input.len() {
            return Err(FilterParseError::Trailing(self.pos));
        }
        Ok(filter)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), FilterParseError> {
        let offset = self.pos;
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(found) => Err(FilterParseError::Unexpected { found, offset }),
            None => Err(FilterParseError::UnexpectedEnd),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, FilterParseError> {
        self.skip_spaces();
        self.expect('(')?;
        self.skip_spaces();
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(FilterParseError::UnexpectedEnd),
        };
        self.skip_spaces();
        self.expect(')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, FilterParseError> {
        let mut children = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                Some('(') => children.push(self.parse_filter()?),
                _ => return Ok(children),
            }
        }
    }

    fn parse_item(&mut self) -> Result<Filter, FilterParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ';' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let attr = self.input[start..self.pos].to_string();
        if attr.is_empty() {
            return match self.peek() {
                Some(':') => Err(FilterParseError::Unsupported("extensible match".into())),
                _ => Err(FilterParseError::EmptyAttribute(start)),
            };
        }

        let offset = self.pos;
        let op = match self.bump() {
            Some('=') => '=',
            Some('>') => {
                self.expect('=')?;
                '>'
            }
            Some('<') => {
                self.expect('=')?;
                '<'
            }
            Some('~') => return Err(FilterParseError::Unsupported("approximate match".into())),
            Some(':') => return Err(FilterParseError::Unsupported("extensible match".into())),
            Some(found) => return Err(FilterParseError::Unexpected { found, offset }),
            None => return Err(FilterParseError::UnexpectedEnd),
        };

        let pieces = self.parse_value()?;
        match op {
            '>' | '<' => {
                if pieces.len() != 1 {
                    return Err(FilterParseError::Unexpected {
                        found: '*',
                        offset,
                    });
                }
                let value = pieces.into_iter().next().unwrap_or_default();
                Ok(if op == '>' {
                    Filter::GreaterOrEqual { attr, value }
                } else {
                    Filter::LessOrEqual { attr, value }
                })
            }
            _ => match pieces.len() {
                1 => Ok(Filter::Equality {
                    attr,
                    value: pieces.into_iter().next().unwrap_or_default(),
                }),
                2 if pieces[0].is_empty() && pieces[1].is_empty() => Ok(Filter::Present(attr)),
                _ => {
                    let last = pieces.len() - 1;
                    let mut initial = None;
                    let mut final_ = None;
                    let mut any = Vec::new();
                    for (i, piece) in pieces.into_iter().enumerate() {
                        if i == 0 {
                            initial = Some(piece).filter(|p| !p.is_empty());
                        } else if i == last {
                            final_ = Some(piece).filter(|p| !p.is_empty());
                        } else if !piece.is_empty() {
                            any.push(piece);
                        }
                    }
                    Ok(Filter::Substrings {
                        attr,
                        initial,
                        any,
                        final_,
                    })
                }
            },
        }
    }

    /// Read an assertion value up to the closing paren, split on unescaped `*`.
    fn parse_value(&mut self) -> Result<Vec<String>, FilterParseError> {
        let mut pieces = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        loop {
            let offset = self.pos;
            match self.peek() {
                None => return Err(FilterParseError::UnexpectedEnd),
                Some(')') => break,
                Some('(') => {
                    return Err(FilterParseError::Unexpected {
                        found: '(',
                        offset,
                    })
                }
                Some('*') => {
                    self.pos += 1;
                    pieces.push(String::from_utf8_lossy(&current).into_owned());
                    current.clear();
                }
                Some('\\') => {
                    self.pos += 1;
                    let hex = self
                        .input
                        .get(self.pos..self.pos + 2)
                        .ok_or(FilterParseError::InvalidEscape(offset))?;
                    let byte = u8::from_str_radix(hex, 16)
                        .map_err(|_| FilterParseError::InvalidEscape(offset))?;
                    current.push(byte);
                    self.pos += 2;
                }
                Some(c) => {
                    self.pos += c.len_utf8();
                    let mut buf = [0u8; 4];
                    current.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        pieces.push(String::from_utf8_lossy(&current).into_owned());
        Ok(pieces)
    }
}
