//! A small CSS selector subset: type, `*`, `#id`, `.class`, attribute
//! selectors (`[a]`, `[a=v]`, `[a~=v]`, `[a^=v]`, `[a$=v]`, `[a*=v]`),
//! compounds, descendant combinators and comma lists.

use anyhow::{bail, Result};

use crate::document::NodeRef;

/// What the matcher needs to know about a tree
pub trait SelectorTarget {
    fn tag(&self, node: NodeRef) -> Option<&str>;
    fn attr(&self, node: NodeRef, name: &str) -> Option<&str>;
    fn parent(&self, node: NodeRef) -> Option<NodeRef>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Equals,
    Includes,
    Prefix,
    Suffix,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrSelector {
    name: String,
    test: Option<(AttrOp, String)>,
}

impl AttrSelector {
    fn matches(&self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match &self.test {
            None => true,
            Some((AttrOp::Equals, expected)) => value == expected,
            Some((AttrOp::Includes, expected)) => value.split_whitespace().any(|t| t == expected),
            Some((AttrOp::Prefix, expected)) => !expected.is_empty() && value.starts_with(expected.as_str()),
            Some((AttrOp::Suffix, expected)) => !expected.is_empty() && value.ends_with(expected.as_str()),
            Some((AttrOp::Substring, expected)) => !expected.is_empty() && value.contains(expected.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    ids: Vec<String>,
    classes: Vec<String>,
    attrs: Vec<AttrSelector>,
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.ids.is_empty() && self.classes.is_empty() && self.attrs.is_empty()
    }

    fn matches<T: SelectorTarget + ?Sized>(&self, target: &T, node: NodeRef) -> bool {
        let Some(tag) = target.tag(node) else {
            return false;
        };
        if let Some(expected) = &self.tag {
            if expected != "*" && !expected.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if self.ids.iter().any(|id| target.attr(node, "id") != Some(id.as_str())) {
            return false;
        }
        if !self.classes.is_empty() {
            let classes = target.attr(node, "class").unwrap_or("");
            if !self
                .classes
                .iter()
                .all(|class| classes.split_whitespace().any(|c| c == class))
            {
                return false;
            }
        }
        self.attrs.iter().all(|a| a.matches(target.attr(node, &a.name)))
    }
}

/// A parsed selector list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    alternatives: Vec<Vec<Compound>>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Selector> {
        let mut alternatives = Vec::new();
        for part in split_top_level(input, ',') {
            let part = part.trim();
            if part.is_empty() {
                bail!("invalid selector {:?}: empty alternative", input);
            }
            alternatives.push(parse_complex(part).map_err(|e| anyhow::anyhow!("invalid selector {:?}: {}", input, e))?);
        }
        if alternatives.is_empty() {
            bail!("invalid selector {:?}: empty", input);
        }
        Ok(Selector { alternatives })
    }

    pub fn matches<T: SelectorTarget + ?Sized>(&self, target: &T, node: NodeRef) -> bool {
        self.alternatives
            .iter()
            .any(|parts| matches_complex(parts, target, node))
    }
}

fn matches_complex<T: SelectorTarget + ?Sized>(parts: &[Compound], target: &T, node: NodeRef) -> bool {
    let Some((last, rest)) = parts.split_last() else {
        return false;
    };
    if !last.matches(target, node) {
        return false;
    }

    // Descendant-only chains match greedily against the nearest ancestor.
    let mut cursor = target.parent(node);
    for part in rest.iter().rev() {
        loop {
            let Some(ancestor) = cursor else {
                return false;
            };
            cursor = target.parent(ancestor);
            if part.matches(target, ancestor) {
                break;
            }
        }
    }
    true
}

/// Split on `sep` outside brackets and quotes
fn split_top_level(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, c) if c == sep && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn parse_complex(input: &str) -> Result<Vec<Compound>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '[') => {
                depth += 1;
                current.push(c);
            }
            (None, ']') => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            (None, '>') | (None, '+') | (None, '~') if depth == 0 => {
                bail!("combinator {:?} is not supported", c);
            }
            (None, c) if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    parts.push(parse_compound(&current)?);
                    current.clear();
                }
            }
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() || depth != 0 {
        bail!("unterminated attribute selector");
    }
    if !current.is_empty() {
        parts.push(parse_compound(&current)?);
    }
    Ok(parts)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn take_ident(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() && is_ident_char(chars[*pos]) {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

fn parse_compound(input: &str) -> Result<Compound> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;
    let mut compound = Compound::default();

    if chars.first() == Some(&'*') {
        compound.tag = Some("*".to_string());
        pos = 1;
    } else if chars.first().map(|c| is_ident_char(*c)).unwrap_or(false) {
        compound.tag = Some(take_ident(&chars, &mut pos).to_lowercase());
    }

    while pos < chars.len() {
        match chars[pos] {
            '#' => {
                pos += 1;
                let id = take_ident(&chars, &mut pos);
                if id.is_empty() {
                    bail!("empty id selector");
                }
                compound.ids.push(id);
            }
            '.' => {
                pos += 1;
                let class = take_ident(&chars, &mut pos);
                if class.is_empty() {
                    bail!("empty class selector");
                }
                compound.classes.push(class);
            }
            '[' => {
                pos += 1;
                let end = chars[pos..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|offset| pos + offset)
                    .ok_or_else(|| anyhow::anyhow!("unterminated attribute selector"))?;
                let body: String = chars[pos..end].iter().collect();
                compound.attrs.push(parse_attr(&body)?);
                pos = end + 1;
            }
            other => bail!("unexpected character {:?}", other),
        }
    }

    if compound.is_empty() {
        bail!("empty compound selector");
    }
    Ok(compound)
}

fn parse_attr(body: &str) -> Result<AttrSelector> {
    let body = body.trim();
    let Some(eq) = body.find('=') else {
        if body.is_empty() || !body.chars().all(is_ident_char) {
            bail!("invalid attribute name {:?}", body);
        }
        return Ok(AttrSelector {
            name: body.to_string(),
            test: None,
        });
    };

    let (head, value) = (&body[..eq], &body[eq + 1..]);
    let (name, op) = match head.chars().last() {
        Some('~') => (&head[..head.len() - 1], AttrOp::Includes),
        Some('^') => (&head[..head.len() - 1], AttrOp::Prefix),
        Some('$') => (&head[..head.len() - 1], AttrOp::Suffix),
        Some('*') => (&head[..head.len() - 1], AttrOp::Substring),
        _ => (head, AttrOp::Equals),
    };
    let name = name.trim();
    if name.is_empty() || !name.chars().all(is_ident_char) {
        bail!("invalid attribute name {:?}", name);
    }

    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Ok(AttrSelector {
        name: name.to_string(),
        test: Some((op, value.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct Fixture {
        tags: HashMap<i64, &'static str>,
        attrs: HashMap<(i64, &'static str), &'static str>,
        parents: HashMap<i64, i64>,
    }

    impl SelectorTarget for Fixture {
        fn tag(&self, node: NodeRef) -> Option<&str> {
            self.tags.get(&node.0).copied()
        }
        fn attr(&self, node: NodeRef, name: &str) -> Option<&str> {
            self.attrs
                .iter()
                .find(|((n, a), _)| *n == node.0 && *a == name)
                .map(|(_, v)| *v)
        }
        fn parent(&self, node: NodeRef) -> Option<NodeRef> {
            self.parents.get(&node.0).copied().map(NodeRef)
        }
    }

    // body(1) > div.chat-panel#first(2) > div.composer[contenteditable=true](3)
    fn fixture() -> Fixture {
        Fixture {
            tags: HashMap::from([(1, "body"), (2, "div"), (3, "div")]),
            attrs: HashMap::from([
                ((2, "class"), "chat-panel wide"),
                ((2, "id"), "first"),
                ((3, "class"), "composer"),
                ((3, "contenteditable"), "true"),
                ((3, "data-role"), "compose box"),
            ]),
            parents: HashMap::from([(2, 1), (3, 2)]),
        }
    }

    fn matches(selector: &str, node: i64) -> bool {
        Selector::parse(selector).unwrap().matches(&fixture(), NodeRef(node))
    }

    #[test]
    fn test_simple_and_compound() {
        assert!(matches("div", 2));
        assert!(matches("DIV", 2));
        assert!(matches("*", 1));
        assert!(matches(".chat-panel", 2));
        assert!(matches("div.chat-panel.wide#first", 2));
        assert!(!matches("div.chat-panel.narrow", 2));
        assert!(!matches("span.chat-panel", 2));
        assert!(matches("#first", 2));
    }

    #[test]
    fn test_attribute_operators() {
        assert!(matches("[contenteditable]", 3));
        assert!(matches("[contenteditable=true]", 3));
        assert!(matches("[contenteditable=\"true\"]", 3));
        assert!(matches("[contenteditable='true']", 3));
        assert!(!matches("[contenteditable=false]", 3));
        assert!(matches("[data-role~=box]", 3));
        assert!(matches("[data-role^=comp]", 3));
        assert!(matches("[data-role$=box]", 3));
        assert!(matches("[data-role*=se b]", 3));
        assert!(!matches("[data-role~=compo]", 3));
    }

    #[test]
    fn test_descendant_and_lists() {
        assert!(matches(".chat-panel .composer", 3));
        assert!(matches("body .composer", 3));
        assert!(matches("body div .composer", 3));
        assert!(!matches(".composer .chat-panel", 2));
        assert!(matches("span, .composer", 3));
        assert!(!matches("span, p", 3));
    }

    #[test]
    fn test_rejects_unsupported_input() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("div >").is_err());
        assert!(Selector::parse("div > p").is_err());
        assert!(Selector::parse("[unterminated").is_err());
        assert!(Selector::parse("a,,b").is_err());
        assert!(Selector::parse("div:hover").is_err());
    }
}
