// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Transport and event core for [XMPP](https://xmpp.org/) streams on top of
//! [tokio](https://tokio.rs/).
//!
//! An [`XmppStream`] connects a socket, parses the never-ending XML stream
//! incrementally and hands each top-level element (a stanza) to the
//! handlers whose matcher accepts it. Handlers run on a pool of workers,
//! outbound data goes through a single sender task, and a scheduler fires
//! delayed and periodic callbacks on the same workers.
//!
//! # Getting started
//!
//! Build a stream from a [`Config`], register handlers and plugins, then
//! [`connect`](XmppStream::connect) and [`process`](XmppStream::process).
//! A runnable client lives in `demos/echo_client.rs`.
//!
//! # Features
//!
//! - [x] Incremental parsing with stream restarts
//! - [x] STARTTLS and implicit TLS (`tls-rust`)
//! - [x] Automatic reconnection
//! - [x] Custom transports via the [`connect::Connector`] trait
//! - [ ] Authentication and resource binding; see the [`plugin`] module for
//!   how such layers hook in

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod config;
pub mod connect;
/// Detailed error types
pub mod error;
mod event;
pub mod handler;
pub mod plugin;
mod scheduler;
pub mod stanza;
pub mod state;
mod stream;
pub mod xmlstream;

pub use crate::config::Config;
#[doc(inline)]
pub use crate::error::{Error, HandlerError, ProtocolError};
pub use crate::event::{Phase, StreamEvent, TaskFn};
pub use crate::stanza::{Stanza, StanzaTypes};
pub use crate::state::{Condition, StateMachine};
pub use crate::stream::{StreamStartFn, XmppStream, XmppStreamBuilder};

// Re-exports
pub use minidom;
pub use xmpp_parsers as parsers;
