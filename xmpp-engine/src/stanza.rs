// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parsed protocol units and the per-stream registry of stanza kinds.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use rand::{thread_rng, Rng};
use xmpp_parsers::ns;

use crate::minidom::Element;
use crate::{Error, HandlerError, XmppStream};

/// Generate a random stanza id.
pub fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// Serialise an element to its wire form.
pub fn serialize(element: &Element) -> Result<String, Error> {
    let mut buf = Vec::new();
    element.write_to(&mut buf)?;
    String::from_utf8(buf).map_err(|e| Error::Utf8(e.utf8_error()))
}

/// Behaviour attached to a class of stanzas, selected by the root element
/// name.
///
/// The kind decides what happens when nobody wants a stanza and when a
/// handler fails on it. Both hooks have harmless defaults.
pub trait StanzaKind: Send + Sync {
    /// Local name of the root element this kind applies to.
    fn name(&self) -> &str;

    /// Called exactly once, on the read loop, for a stanza no handler
    /// matched.
    fn unhandled(&self, stream: &XmppStream, stanza: &Stanza) {
        let _ = stream;
        log::debug!("unhandled <{}/> stanza", stanza.name());
    }

    /// Called on the worker when a handler failed while processing `stanza`.
    fn exception(&self, stream: &XmppStream, stanza: &Stanza, error: &HandlerError) {
        let _ = stream;
        log::error!("error while handling <{}/>: {}", stanza.name(), error);
    }
}

/// Kind for any root element without a registered kind.
#[derive(Debug, Default)]
pub struct Generic;

impl StanzaKind for Generic {
    fn name(&self) -> &str {
        "*"
    }
}

/// Kind with default behaviour and a fixed root name.
#[derive(Debug)]
pub struct Named(pub &'static str);

impl StanzaKind for Named {
    fn name(&self) -> &str {
        self.0
    }
}

/// `<iq/>`: requests must always get an answer.
///
/// Unhandled `get`/`set` requests are answered with
/// `feature-not-implemented`, requests whose handler failed with
/// `undefined-condition`.
#[derive(Debug, Default)]
pub struct Iq;

impl Iq {
    fn is_request(stanza: &Stanza) -> bool {
        matches!(stanza.type_(), Some("get") | Some("set"))
    }
}

impl StanzaKind for Iq {
    fn name(&self) -> &str {
        "iq"
    }

    fn unhandled(&self, stream: &XmppStream, stanza: &Stanza) {
        if !Self::is_request(stanza) {
            log::debug!("dropping unhandled iq result {:?}", stanza.id());
            return;
        }
        let reply = stanza.make_error("cancel", "feature-not-implemented", None);
        if let Err(e) = stream.send_element(&reply) {
            log::warn!("could not answer unhandled iq: {}", e);
        }
    }

    fn exception(&self, stream: &XmppStream, stanza: &Stanza, error: &HandlerError) {
        log::error!("error while handling iq {:?}: {}", stanza.id(), error);
        if !Self::is_request(stanza) {
            return;
        }
        let text = error.to_string();
        let reply = stanza.make_error("cancel", "undefined-condition", Some(&text));
        if let Err(e) = stream.send_element(&reply) {
            log::warn!("could not report handler failure: {}", e);
        }
    }
}

/// A child element registered as an extension of a stanza kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Name under which the extension is looked up.
    pub name: String,
    /// Local name of the extension element.
    pub element: String,
    /// Namespace of the extension element.
    pub ns: String,
}

/// Per-stream registry turning parsed elements into [`Stanza`]s.
///
/// Owned by one [`XmppStream`]; registrations never leak between streams.
#[derive(Clone)]
pub struct StanzaTypes {
    kinds: HashMap<String, Arc<dyn StanzaKind>>,
    extensions: HashMap<String, Arc<[Extension]>>,
    fallback: Arc<dyn StanzaKind>,
}

impl Default for StanzaTypes {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for StanzaTypes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StanzaTypes")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .field("extensions", &self.extensions)
            .finish()
    }
}

impl StanzaTypes {
    /// Registry without any kinds: everything is [`Generic`].
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
            extensions: HashMap::new(),
            fallback: Arc::new(Generic),
        }
    }

    /// Registry with the three core XMPP stanzas.
    pub fn xmpp() -> Self {
        let mut types = Self::empty();
        types.register(Iq);
        types.register(Named("message"));
        types.register(Named("presence"));
        types
    }

    /// Register a root stanza kind, replacing one with the same name.
    pub fn register<K: StanzaKind + 'static>(&mut self, kind: K) -> &mut Self {
        self.kinds.insert(kind.name().to_owned(), Arc::new(kind));
        self
    }

    /// Remove the kind registered for `name`.
    pub fn remove(&mut self, name: &str) -> bool {
        self.kinds.remove(name).is_some()
    }

    /// Register an extension child element for the stanza kind `stanza`.
    pub fn register_extension(&mut self, stanza: &str, extension: Extension) -> &mut Self {
        let mut list: Vec<Extension> = self
            .extensions
            .get(stanza)
            .map(|l| l.to_vec())
            .unwrap_or_default();
        list.retain(|e| e.name != extension.name);
        list.push(extension);
        self.extensions.insert(stanza.to_owned(), list.into());
        self
    }

    /// Remove an extension registration.
    pub fn remove_extension(&mut self, stanza: &str, name: &str) -> bool {
        let Some(list) = self.extensions.get(stanza) else {
            return false;
        };
        let before = list.len();
        let list: Vec<Extension> = list.iter().filter(|e| e.name != name).cloned().collect();
        let removed = list.len() != before;
        self.extensions.insert(stanza.to_owned(), list.into());
        removed
    }

    /// Build the typed unit for an element received at stanza depth.
    ///
    /// Elements outside `default_ns` or without a registered kind fall back
    /// to [`Generic`].
    pub fn build(&self, element: Element, default_ns: &str) -> Stanza {
        let kind = if element.ns() == default_ns {
            self.kinds.get(element.name()).cloned()
        } else {
            None
        };
        let kind = kind.unwrap_or_else(|| self.fallback.clone());
        let extensions = self
            .extensions
            .get(element.name())
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()));
        Stanza {
            element,
            kind,
            extensions,
        }
    }
}

/// A complete protocol unit received at depth 1 of the stream.
///
/// Cloning a stanza deep-copies its element tree, which is what keeps
/// concurrently running handlers isolated from each other.
#[derive(Clone)]
pub struct Stanza {
    element: Element,
    kind: Arc<dyn StanzaKind>,
    extensions: Arc<[Extension]>,
}

impl fmt::Debug for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stanza")
            .field("kind", &self.kind.name())
            .field("element", &self.element)
            .finish()
    }
}

impl Stanza {
    /// The stanza kind this unit was built as.
    pub fn kind(&self) -> &Arc<dyn StanzaKind> {
        &self.kind
    }

    /// The underlying element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Mutable access to the underlying element.
    pub fn element_mut(&mut self) -> &mut Element {
        &mut self.element
    }

    /// Unwrap into the underlying element.
    pub fn into_element(self) -> Element {
        self.element
    }

    /// Local name of the root element.
    pub fn name(&self) -> &str {
        self.element.name()
    }

    /// Namespace of the root element.
    pub fn ns(&self) -> String {
        self.element.ns()
    }

    /// Attribute lookup on the root element.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.attr(name)
    }

    /// The `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    /// The `from` attribute.
    pub fn from(&self) -> Option<&str> {
        self.attr("from")
    }

    /// The `to` attribute.
    pub fn to(&self) -> Option<&str> {
        self.attr("to")
    }

    /// The `type` attribute.
    pub fn type_(&self) -> Option<&str> {
        self.attr("type")
    }

    /// The child registered as extension `name` for this stanza's kind.
    pub fn extension(&self, name: &str) -> Option<&Element> {
        let ext = self.extensions.iter().find(|e| e.name == name)?;
        self.element.get_child(&ext.element, ext.ns.as_str())
    }

    /// Serialise for logging or sending.
    pub fn to_xml(&self) -> Result<String, Error> {
        serialize(&self.element)
    }

    /// Create an empty reply addressed back to the sender.
    ///
    /// `id` is kept; an `<iq/>` reply gets `type='result'`.
    pub fn make_reply(&self) -> Element {
        let mut builder = Element::builder(self.name(), self.ns());
        if let Some(id) = self.id() {
            builder = builder.attr("id", id.to_owned());
        }
        if let Some(from) = self.from() {
            builder = builder.attr("to", from.to_owned());
        }
        if let Some(to) = self.to() {
            builder = builder.attr("from", to.to_owned());
        }
        if self.name() == "iq" {
            builder = builder.attr("type", "result".to_owned());
        }
        builder.build()
    }

    /// Create an error reply carrying a `urn:ietf:params:xml:ns:xmpp-stanzas`
    /// condition.
    pub fn make_error(&self, error_type: &str, condition: &str, text: Option<&str>) -> Element {
        let mut reply = self.make_reply();
        reply.set_attr("type", "error".to_owned());
        let mut error = Element::builder("error", self.ns())
            .attr("type", error_type.to_owned())
            .append(Element::builder(condition, ns::XMPP_STANZAS).build())
            .build();
        if let Some(text) = text {
            let mut text_el = Element::builder("text", ns::XMPP_STANZAS).build();
            text_el.append_text_node(text.to_owned());
            error.append_child(text_el);
        }
        reply.append_child(error);
        reply
    }
}
