// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Predicates deciding which stanzas a handler receives.

use crate::error::ProtocolError;
use crate::minidom::Element;
use crate::xmlstream::parse_element;
use crate::{Error, Stanza};

/// Capability predicate over a parsed unit.
pub trait Matcher: Send + Sync {
    /// Whether `stanza` is accepted.
    fn matches(&self, stanza: &Stanza) -> bool;
}

/// Match on the root element name and, optionally, its namespace.
#[derive(Debug, Clone)]
pub struct NameMatcher {
    name: String,
    ns: Option<String>,
}

impl NameMatcher {
    /// Match any root element called `name`.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ns: None,
        }
    }

    /// Match root elements called `name` in namespace `ns`.
    pub fn with_ns<S: Into<String>, N: Into<String>>(name: S, ns: N) -> Self {
        Self {
            name: name.into(),
            ns: Some(ns.into()),
        }
    }
}

impl Matcher for NameMatcher {
    fn matches(&self, stanza: &Stanza) -> bool {
        stanza.name() == self.name
            && match self.ns {
                Some(ref ns) => stanza.element().ns() == *ns,
                None => true,
            }
    }
}

/// Match on the `id` attribute, e.g. for IQ responses.
#[derive(Debug, Clone)]
pub struct IdMatcher(pub String);

impl Matcher for IdMatcher {
    fn matches(&self, stanza: &Stanza) -> bool {
        stanza.id() == Some(self.0.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    ns: Option<String>,
    name: String,
}

impl Step {
    fn parse(s: &str) -> Result<Self, Error> {
        if let Some(rest) = s.strip_prefix('{') {
            let Some((ns, name)) = rest.split_once('}') else {
                return Err(ProtocolError::InvalidMask(format!("unterminated namespace in {:?}", s)).into());
            };
            if name.is_empty() {
                return Err(ProtocolError::InvalidMask(format!("empty element name in {:?}", s)).into());
            }
            Ok(Step {
                ns: Some(ns.to_owned()),
                name: name.to_owned(),
            })
        } else if s.is_empty() {
            Err(ProtocolError::InvalidMask(String::from("empty path step")).into())
        } else {
            Ok(Step {
                ns: None,
                name: s.to_owned(),
            })
        }
    }

    fn accepts(&self, element: &Element) -> bool {
        element.name() == self.name
            && match self.ns {
                Some(ref ns) => element.ns() == *ns,
                None => true,
            }
    }
}

/// Match a path of elements, written as `{ns}name/{ns}child/...`.
///
/// The first step is the stanza root, each further step must be a child of
/// the element matched by the previous step. A step without `{ns}` accepts
/// any namespace.
#[derive(Debug, Clone)]
pub struct XPathMatcher {
    steps: Vec<Step>,
}

impl XPathMatcher {
    /// Parse a path.
    pub fn new(path: &str) -> Result<Self, Error> {
        let steps = split_path(path)
            .into_iter()
            .map(Step::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if steps.is_empty() {
            return Err(ProtocolError::InvalidMask(String::from("empty path")).into());
        }
        Ok(Self { steps })
    }

    fn walk(element: &Element, steps: &[Step]) -> bool {
        let Some((step, rest)) = steps.split_first() else {
            return true;
        };
        element
            .children()
            .any(|child| step.accepts(child) && Self::walk(child, rest))
    }
}

// Namespaces are URIs and may themselves contain slashes, so only split
// outside of braces.
fn split_path(path: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, c) in path.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            '/' if depth == 0 => {
                parts.push(&path[start..idx]);
                start = idx + 1;
            }
            _ => (),
        }
    }
    parts.push(&path[start..]);
    parts
}

impl Matcher for XPathMatcher {
    fn matches(&self, stanza: &Stanza) -> bool {
        let (root, rest) = match self.steps.split_first() {
            Some(v) => v,
            None => return false,
        };
        root.accepts(stanza.element()) && Self::walk(stanza.element(), rest)
    }
}

/// Match against an XML mask.
///
/// A stanza matches if its root has the mask's name and namespace, carries
/// every attribute of the mask with the same value, contains the mask's
/// text if the mask has any, and has a matching child for each child of
/// the mask. Additional attributes and children are allowed.
#[derive(Debug, Clone)]
pub struct MaskMatcher {
    mask: Element,
}

impl MaskMatcher {
    /// Parse the mask from XML text, e.g.
    /// `<iq type='get' xmlns='jabber:client'><ping xmlns='urn:xmpp:ping'/></iq>`.
    pub fn new(mask: &str) -> Result<Self, Error> {
        Ok(Self {
            mask: parse_element(mask)?,
        })
    }

    /// Use an already built element as mask.
    pub fn from_element(mask: Element) -> Self {
        Self { mask }
    }

    fn compare(mask: &Element, element: &Element) -> bool {
        if mask.name() != element.name() || mask.ns() != element.ns() {
            return false;
        }
        if !mask
            .attrs()
            .all(|(name, value)| element.attr(name) == Some(value))
        {
            return false;
        }
        let text = mask.text();
        if !text.trim().is_empty() && text != element.text() {
            return false;
        }
        mask.children()
            .all(|sub| element.children().any(|child| Self::compare(sub, child)))
    }
}

impl Matcher for MaskMatcher {
    fn matches(&self, stanza: &Stanza) -> bool {
        Self::compare(&self.mask, stanza.element())
    }
}

/// Matcher backed by a closure; see [`from_fn`].
pub struct FnMatcher<F>(F);

/// Use any `Fn(&Stanza) -> bool` as matcher.
pub fn from_fn<F: Fn(&Stanza) -> bool + Send + Sync>(f: F) -> FnMatcher<F> {
    FnMatcher(f)
}

impl<F: Fn(&Stanza) -> bool + Send + Sync> Matcher for FnMatcher<F> {
    fn matches(&self, stanza: &Stanza) -> bool {
        (self.0)(stanza)
    }
}
