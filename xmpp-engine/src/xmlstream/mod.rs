// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Incremental parsing of the inbound stream
//!
//! XMPP never sends a complete document: the stream root stays open for the
//! whole session and the children of the root arrive one by one. This module
//! feeds the socket through [`rxml::AsyncReader`] and keeps an explicit
//! element stack:
//!
//! - depth 0: a start tag here opens the stream root,
//! - depth 1: every element opened here is a stanza and is handed over once
//!   its end tag is seen,
//! - deeper: sub-content, appended to the enclosing element.
//!
//! The end tag of the root closes the stream. Completed stanzas are moved
//! out of the stack, so nothing is retained once they have been dispatched.

use core::future::poll_fn;
use core::pin::Pin;
use std::io;

use rxml::{AttrMap, Event, Namespace, NcName};
use tokio::io::AsyncBufRead;

use crate::handler::Directive;
use crate::minidom::Element;
use crate::Error;


const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Result of one step of the parse loop.
#[derive(Debug)]
pub(crate) enum ParseStep {
    /// Keep reading.
    Continue,
    /// The parser was reset and expects a new stream header.
    Restart,
    /// The parser was reset; the socket must be upgraded before reading on.
    StartTls,
    /// The stream root was closed, or a handler asked to close.
    Closed,
    /// Reading or parsing failed; the connection attempt is over.
    Fatal(Error),
}

/// Receiver of what the parse loop sees.
pub(crate) trait StreamDelegate {
    /// The stream root was opened.
    fn stream_start(&mut self, root: &Element) -> Result<(), Error>;

    /// A stanza was completed.
    fn stanza(&mut self, element: Element) -> Directive;
}

/// Build an element out of a start tag.
///
/// Attributes in the `xml` namespace keep their prefix (`xml:lang`).
/// Attributes in any other namespace are dropped: the element tree only
/// knows local names, and keeping them would let `a:type` shadow `type`.
fn element_from_start((ns, name): (Namespace, NcName), attrs: AttrMap) -> Element {
    let mut element = Element::builder(name.to_string(), ns.to_string()).build();
    for ((attr_ns, attr_name), value) in attrs.into_iter() {
        let attr_ns = attr_ns.to_string();
        let key = if attr_ns.is_empty() {
            attr_name.to_string()
        } else if attr_ns == XML_NS {
            format!("xml:{}", attr_name)
        } else {
            log::debug!(
                "dropping attribute {{{}}}{} of <{}/>",
                attr_ns,
                attr_name,
                element.name()
            );
            continue;
        };
        element.set_attr(key, value.to_string());
    }
    element
}

/// Element stack shared by the stream reader and [`parse_element`].
#[derive(Debug, Default)]
struct TreeBuilder {
    stack: Vec<Element>,
}

impl TreeBuilder {
    fn depth(&self) -> usize {
        self.stack.len()
    }

    fn open(&mut self, element: Element) {
        self.stack.push(element);
    }

    fn text(&mut self, data: String) {
        if let Some(top) = self.stack.last_mut() {
            top.append_text_node(data);
        }
    }

    /// Close the innermost element; returns it if it was the outermost one.
    fn close(&mut self) -> Option<Element> {
        let element = self.stack.pop()?;
        match self.stack.last_mut() {
            Some(parent) => {
                parent.append_child(element);
                None
            }
            None => Some(element),
        }
    }

    fn clear(&mut self) {
        self.stack.clear();
    }
}

/// Incremental reader turning a byte stream into stanzas.
pub(crate) struct StanzaReader<Io> {
    parser: Pin<Box<rxml::AsyncReader<Io>>>,
    root: Option<Element>,
    tree: TreeBuilder,
}

impl<Io: AsyncBufRead + Unpin> StanzaReader<Io> {
    pub(crate) fn new(io: Io) -> Self {
        Self {
            parser: Box::pin(rxml::AsyncReader::wrap(io, rxml::Parser::default())),
            root: None,
            tree: TreeBuilder::default(),
        }
    }

    /// Current parse depth; 0 outside the stream root.
    pub(crate) fn depth(&self) -> usize {
        match self.root {
            Some(_) => self.tree.depth() + 1,
            None => 0,
        }
    }

    /// The root element of the current stream, once opened.
    pub(crate) fn root(&self) -> Option<&Element> {
        self.root.as_ref()
    }

    /// Forget all parser state, keeping the underlying reader.
    pub(crate) fn reset(&mut self) {
        *self.parser.as_mut().parser_pinned() = rxml::Parser::default();
        self.root = None;
        self.tree.clear();
    }

    async fn next_event(&mut self) -> io::Result<Option<Event>> {
        poll_fn(|cx| self.parser.as_mut().poll_read(cx)).await
    }

    /// Read until something the caller has to act upon happens.
    ///
    /// Returns [`ParseStep::Continue`] after every dispatched stanza whose
    /// handlers did not ask for anything else. End of input before the root
    /// was closed is fatal.
    pub(crate) async fn step<D: StreamDelegate>(&mut self, delegate: &mut D) -> ParseStep {
        loop {
            let event = match self.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => return ParseStep::Fatal(Error::Disconnected),
                Err(e) => return ParseStep::Fatal(e.into()),
            };
            match event {
                Event::XmlDeclaration(_, _) => (),
                Event::StartElement(_, qname, attrs) => {
                    let element = element_from_start(qname, attrs);
                    if self.root.is_none() {
                        if let Err(e) = delegate.stream_start(&element) {
                            return ParseStep::Fatal(e);
                        }
                        self.root = Some(element);
                    } else {
                        self.tree.open(element);
                    }
                }
                Event::Text(_, data) => {
                    let data = data.to_string();
                    if self.tree.depth() > 0 {
                        self.tree.text(data);
                    } else if !data.trim().is_empty() {
                        log::warn!("text between stanzas: {:?}", data);
                        return ParseStep::Fatal(
                            io::Error::new(
                                io::ErrorKind::InvalidData,
                                "text content at stream level",
                            )
                            .into(),
                        );
                    }
                }
                Event::EndElement(_) => {
                    if self.tree.depth() == 0 {
                        log::debug!("stream closed by peer");
                        self.root = None;
                        return ParseStep::Closed;
                    }
                    if let Some(stanza) = self.tree.close() {
                        match delegate.stanza(stanza) {
                            Directive::Continue => return ParseStep::Continue,
                            Directive::Restart => {
                                self.reset();
                                return ParseStep::Restart;
                            }
                            Directive::StartTls => {
                                self.reset();
                                return ParseStep::StartTls;
                            }
                            Directive::Close => return ParseStep::Closed,
                        }
                    }
                }
            }
        }
    }
}

/// Parse a standalone XML fragment into an element.
///
/// Trailing data after the first complete element is ignored.
pub fn parse_element(xml: &str) -> Result<Element, Error> {
    let mut buf = xml.as_bytes();
    let reader = rxml::Reader::new(&mut buf);
    let mut tree = TreeBuilder::default();
    for event in reader {
        match event? {
            Event::XmlDeclaration(_, _) => (),
            Event::StartElement(_, qname, attrs) => tree.open(element_from_start(qname, attrs)),
            Event::Text(_, data) => tree.text(data.to_string()),
            Event::EndElement(_) => {
                if let Some(element) = tree.close() {
                    return Ok(element);
                }
            }
        }
    }
    Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no complete element in input").into())
}
