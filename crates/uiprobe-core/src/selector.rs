//! CSS-subset selectors and the composable ignore predicate.
//!
//! Supported grammar:
//!
//! ```text
//! list      := complex ( "," complex )*
//! complex   := compound ( combinator compound )*
//! combinator:= whitespace | ">"
//! compound  := ( "*" | tag )? ( "#" ident | "." ident | attr )*
//! attr      := "[" name ( ( "=" | "^=" | "*=" ) value )? "]"
//! value     := ident-ish | "quoted" | 'quoted'
//! ```
//!
//! Matching runs right to left with backtracking over descendant
//! combinators, against an [`ElementRef`] and its ancestor chain.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::dom::{ElementRef, Node};
use crate::error::SelectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    /// `a b`
    Descendant,
    /// `a > b`
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals(String),
    Prefix(String),
    Contains(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrMatcher {
    name: String,
    op: AttrOp,
}

impl AttrMatcher {
    fn matches(&self, node: &Node) -> bool {
        let Some(value) = node.attr(&self.name) else {
            return false;
        };
        match &self.op {
            AttrOp::Exists => true,
            AttrOp::Equals(expected) => value == expected,
            AttrOp::Prefix(prefix) => !prefix.is_empty() && value.starts_with(prefix.as_str()),
            AttrOp::Contains(needle) => !needle.is_empty() && value.contains(needle.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Compound {
    /// `None` is the universal selector.
    tag: Option<String>,
    ids: Vec<String>,
    classes: Vec<String>,
    attrs: Vec<AttrMatcher>,
}

impl Compound {
    fn matches(&self, node: &Node) -> bool {
        if let Some(tag) = &self.tag {
            if node.tag != *tag {
                return false;
            }
        }
        self.ids.iter().all(|id| node.id() == Some(id.as_str()))
            && self.classes.iter().all(|c| node.has_class(c))
            && self.attrs.iter().all(|a| a.matches(node))
    }
}

/// `compounds[i]` and `compounds[i + 1]` are joined by `combinators[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    compounds: Vec<Compound>,
    combinators: Vec<Combinator>,
}

impl Complex {
    fn matches(&self, element: ElementRef<'_>) -> bool {
        self.compounds
            .len()
            .checked_sub(1)
            .is_some_and(|last| self.match_at(last, element))
    }

    fn match_at(&self, idx: usize, element: ElementRef<'_>) -> bool {
        if !self.compounds[idx].matches(element.node) {
            return false;
        }
        if idx == 0 {
            return true;
        }
        match self.combinators[idx - 1] {
            Combinator::Child => element
                .parent()
                .is_some_and(|parent| self.match_at(idx - 1, parent)),
            Combinator::Descendant => {
                let mut current = element.parent();
                while let Some(ancestor) = current {
                    if self.match_at(idx - 1, ancestor) {
                        return true;
                    }
                    current = ancestor.parent();
                }
                false
            }
        }
    }
}

/// A parsed selector list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    alternatives: Vec<Complex>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        Parser::new(input).parse_list()
    }

    /// `tag`
    #[must_use]
    pub fn tag(name: &str) -> Self {
        let tag = name.to_ascii_lowercase();
        Self::single(
            tag.clone(),
            Compound {
                tag: Some(tag),
                ..Compound::default()
            },
        )
    }

    /// `[name]`
    #[must_use]
    pub fn has_attribute(name: &str) -> Self {
        Self::single(
            format!("[{name}]"),
            Compound {
                attrs: vec![AttrMatcher {
                    name: name.to_string(),
                    op: AttrOp::Exists,
                }],
                ..Compound::default()
            },
        )
    }

    fn single(source: String, compound: Compound) -> Self {
        Self {
            source,
            alternatives: vec![Complex {
                compounds: vec![compound],
                combinators: Vec::new(),
            }],
        }
    }

    /// The selector text as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Does `element` itself match?
    #[must_use]
    pub fn matches(&self, element: ElementRef<'_>) -> bool {
        self.alternatives.iter().any(|c| c.matches(element))
    }

    /// Does `element` or any of its ancestors match?
    #[must_use]
    pub fn matches_within(&self, element: ElementRef<'_>) -> bool {
        element.self_and_ancestors().any(|el| self.matches(el))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn unexpected(&self) -> SelectorError {
        match self.peek() {
            Some(found) => SelectorError::Unexpected {
                input: self.input.to_string(),
                position: self.pos,
                found,
            },
            None => self.end(),
        }
    }

    fn end(&self) -> SelectorError {
        SelectorError::UnexpectedEnd {
            input: self.input.to_string(),
        }
    }

    fn expect(&mut self, want: char) -> Result<(), SelectorError> {
        if self.peek() == Some(want) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn parse_list(mut self) -> Result<Selector, SelectorError> {
        if self.input.trim().is_empty() {
            return Err(SelectorError::Empty);
        }
        let mut alternatives = vec![self.parse_complex()?];
        while self.peek() == Some(',') {
            self.pos += 1;
            alternatives.push(self.parse_complex()?);
        }
        if self.peek().is_some() {
            return Err(self.unexpected());
        }
        Ok(Selector {
            source: self.input.trim().to_string(),
            alternatives,
        })
    }

    fn parse_complex(&mut self) -> Result<Complex, SelectorError> {
        self.skip_ws();
        let mut compounds = vec![self.parse_compound()?];
        let mut combinators = Vec::new();
        loop {
            let had_ws = self.skip_ws();
            match self.peek() {
                None | Some(',') => break,
                Some('>') => {
                    self.pos += 1;
                    self.skip_ws();
                    combinators.push(Combinator::Child);
                }
                Some(_) if had_ws => combinators.push(Combinator::Descendant),
                Some(_) => return Err(self.unexpected()),
            }
            compounds.push(self.parse_compound()?);
        }
        Ok(Complex {
            compounds,
            combinators,
        })
    }

    fn parse_compound(&mut self) -> Result<Compound, SelectorError> {
        let start = self.pos;
        let mut compound = Compound::default();
        match self.peek() {
            Some('*') => {
                self.pos += 1;
            }
            Some(c) if is_ident_char(c) => {
                compound.tag = Some(self.ident()?.to_ascii_lowercase());
            }
            _ => {}
        }
        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.ids.push(self.ident()?);
                }
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attrs.push(self.attr()?);
                }
                _ => break,
            }
        }
        if self.pos == start {
            return Err(self.unexpected());
        }
        Ok(compound)
    }

    fn ident(&mut self) -> Result<String, SelectorError> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.unexpected());
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn attr(&mut self) -> Result<AttrMatcher, SelectorError> {
        self.skip_ws();
        let name = self.ident()?;
        self.skip_ws();
        let op: fn(String) -> AttrOp = match self.peek() {
            Some(']') => {
                self.pos += 1;
                return Ok(AttrMatcher {
                    name,
                    op: AttrOp::Exists,
                });
            }
            Some('=') => {
                self.pos += 1;
                AttrOp::Equals
            }
            Some('^') => {
                self.pos += 1;
                self.expect('=')?;
                AttrOp::Prefix
            }
            Some('*') => {
                self.pos += 1;
                self.expect('=')?;
                AttrOp::Contains
            }
            _ => return Err(self.unexpected()),
        };
        self.skip_ws();
        let value = self.value()?;
        self.skip_ws();
        self.expect(']')?;
        Ok(AttrMatcher {
            name,
            op: op(value),
        })
    }

    fn value(&mut self) -> Result<String, SelectorError> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.bump() {
                        None => return Err(self.end()),
                        Some(c) if c == quote => return Ok(out),
                        Some('\\') => match self.bump() {
                            Some(escaped) => out.push(escaped),
                            None => return Err(self.end()),
                        },
                        Some(c) => out.push(c),
                    }
                }
            }
            Some(_) => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| !c.is_whitespace() && !matches!(c, ']' | '"' | '\'' | '['))
                {
                    self.pos += 1;
                }
                if self.pos == start {
                    return Err(self.unexpected());
                }
                Ok(self.chars[start..self.pos].iter().collect())
            }
            None => Err(self.end()),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Predicate over an element, used for ignore rules that selectors cannot
/// express.
pub type ElementPredicate = Arc<dyn Fn(ElementRef<'_>) -> bool + Send + Sync>;

/// Elements to exclude from observation.
///
/// An element is ignored when it, or any ancestor, matches one of the
/// selectors or predicates.
#[derive(Clone, Default)]
pub struct IgnoreList {
    selectors: Vec<Selector>,
    predicates: Vec<ElementPredicate>,
}

impl IgnoreList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_selectors<I, S>(selectors: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let selectors = selectors
            .into_iter()
            .map(|s| Selector::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            selectors,
            predicates: Vec::new(),
        })
    }

    #[must_use]
    pub fn selector(mut self, selector: Selector) -> Self {
        self.selectors.push(selector);
        self
    }

    #[must_use]
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(ElementRef<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Merge another list into this one.
    #[must_use]
    pub fn extend(mut self, other: Self) -> Self {
        self.selectors.extend(other.selectors);
        self.predicates.extend(other.predicates);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty() && self.predicates.is_empty()
    }

    #[must_use]
    pub fn selectors(&self) -> &[Selector] {
        &self.selectors
    }

    #[must_use]
    pub fn ignores(&self, element: ElementRef<'_>) -> bool {
        if self.is_empty() {
            return false;
        }
        element.self_and_ancestors().any(|el| {
            self.selectors.iter().any(|s| s.matches(el)) || self.predicates.iter().any(|p| p(el))
        })
    }
}

impl fmt::Debug for IgnoreList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IgnoreList")
            .field("selectors", &self.selectors)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Element;

    fn sel(s: &str) -> Selector {
        s.parse().unwrap()
    }

    fn pane_cell() -> Element {
        Element::new(
            Node::new("span").with_attr("class", "cell cursor"),
            vec![
                Node::new("div")
                    .with_attr("class", "terminal-content")
                    .with_attr("data-pane-id", "%1"),
                Node::new("div").with_attr("id", "layout").with_attr("class", "panes"),
                Node::new("body"),
            ],
        )
    }

    #[test]
    fn simple_forms_match() {
        let el = pane_cell();
        let el = el.as_ref();
        assert!(sel("span").matches(el));
        assert!(sel("*").matches(el));
        assert!(sel(".cell").matches(el));
        assert!(sel("span.cell.cursor").matches(el));
        assert!(!sel("div").matches(el));
        assert!(!sel(".cell.missing").matches(el));
    }

    #[test]
    fn attribute_operators() {
        let node = Node::new("div")
            .with_attr("data-pane-id", "%12")
            .with_attr("data-role", "main pane");
        let el = ElementRef::new(&node, &[]);
        assert!(sel("[data-pane-id]").matches(el));
        assert!(sel("[data-pane-id=%12]").matches(el));
        assert!(sel("[data-pane-id=\"%12\"]").matches(el));
        assert!(sel("[data-pane-id^='%1']").matches(el));
        assert!(sel("[data-role*=\"n p\"]").matches(el));
        assert!(!sel("[data-pane-id=%1]").matches(el));
        assert!(!sel("[data-missing]").matches(el));
    }

    #[test]
    fn combinators_backtrack() {
        let el = pane_cell();
        let el = el.as_ref();
        assert!(sel("body span").matches(el));
        assert!(sel("#layout span").matches(el));
        assert!(sel("[data-pane-id] > .cursor").matches(el));
        assert!(sel("body > div > div > span").matches(el));
        assert!(!sel("#layout > span").matches(el));
        assert!(sel(".panes .terminal-content>span").matches(el));
    }

    #[test]
    fn comma_list_is_any() {
        let el = pane_cell();
        assert!(sel("table, span.cell").matches(el.as_ref()));
        assert!(!sel("table, em").matches(el.as_ref()));
    }

    #[test]
    fn matches_within_checks_ancestors() {
        let el = pane_cell();
        assert!(sel(".terminal-content").matches_within(el.as_ref()));
        assert!(!sel(".terminal-content").matches(el.as_ref()));
    }

    #[test]
    fn rejects_malformed_input_with_position() {
        assert_eq!(Selector::parse("   "), Err(SelectorError::Empty));
        assert!(matches!(
            Selector::parse("div >"),
            Err(SelectorError::UnexpectedEnd { .. })
        ));
        assert!(matches!(
            Selector::parse("[data-x"),
            Err(SelectorError::UnexpectedEnd { .. })
        ));
        assert!(matches!(
            Selector::parse("div,"),
            Err(SelectorError::UnexpectedEnd { .. })
        ));
        match Selector::parse("div$") {
            Err(SelectorError::Unexpected {
                position, found, ..
            }) => {
                assert_eq!(position, 3);
                assert_eq!(found, '$');
            }
            other => panic!("expected positioned error, got {other:?}"),
        }
        assert!(Selector::parse("[a~=b]").is_err());
        assert!(Selector::parse("[a$=b]").is_err());
        assert!(Selector::parse("..a").is_err());
    }

    #[test]
    fn built_selectors_equal_parsed_ones() {
        assert_eq!(Selector::tag("BODY"), sel("body"));
        assert_eq!(Selector::has_attribute("data-pane-id"), sel("[data-pane-id]"));
    }

    #[test]
    fn serde_as_string() {
        let s = sel(".a > [data-pane-id]");
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\".a > [data-pane-id]\"");
        let back: Selector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert!(serde_json::from_str::<Selector>("\"div >\"").is_err());
    }

    #[test]
    fn ignore_list_covers_descendants_and_predicates() {
        let el = pane_cell();
        let by_selector = IgnoreList::from_selectors([".terminal-content"]).unwrap();
        assert!(by_selector.ignores(el.as_ref()));

        let by_predicate =
            IgnoreList::new().predicate(|e| e.node.attr("id") == Some("layout"));
        assert!(by_predicate.ignores(el.as_ref()));

        let merged = IgnoreList::from_selectors(["table"])
            .unwrap()
            .extend(by_predicate);
        assert!(merged.ignores(el.as_ref()));
        assert!(!IgnoreList::new().ignores(el.as_ref()));
    }
}
