// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Stanza handlers
//!
//! A [`Handler`] pairs a [`Matcher`] with a name and a callback. The
//! [`Registry`] owned by each [`XmppStream`] keeps them in registration
//! order; for every stanza received, the read loop asks the registry for all
//! matching handlers and queues one deep copy of the stanza per handler.
//!
//! Handlers run in two places:
//!
//! - [`Handler::prerun`] runs on the read loop, before the stanza is queued.
//!   It is meant for the few handlers which must act before the next byte is
//!   parsed (e.g. STARTTLS `<proceed/>`) and can steer the stream through
//!   the returned [`Directive`].
//! - [`Handler::run`] runs later on one of the handler workers.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{HandlerError, Stanza, XmppStream};

mod callback;
pub mod matcher;
mod waiter;

pub use self::callback::Callback;
pub use self::matcher::Matcher;
pub use self::waiter::Waiter;

/// What the read loop should do after a stanza has been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Keep parsing.
    Continue,
    /// Discard the parser state and expect a fresh stream header.
    Restart,
    /// Upgrade the socket to TLS in place, then restart the stream.
    StartTls,
    /// Treat the stream as closed.
    Close,
}

impl Directive {
    /// Combine the directives of several handlers: the first non-`Continue`
    /// one wins.
    pub fn or(self, other: Directive) -> Directive {
        match self {
            Directive::Continue => other,
            _ => self,
        }
    }
}

/// A named receiver of stanzas.
pub trait Handler: Send + Sync {
    /// Registry-unique name.
    fn name(&self) -> &str;

    /// Whether this handler wants `stanza`.
    fn matches(&self, stanza: &Stanza) -> bool;

    /// Hook run on the read loop with the handler's own copy of the stanza,
    /// before that copy is queued for [`Handler::run`].
    fn prerun(&self, stream: &XmppStream, stanza: &Stanza) -> Directive {
        let _ = (stream, stanza);
        Directive::Continue
    }

    /// Process the stanza on a handler worker.
    fn run(&self, stream: &XmppStream, stanza: &mut Stanza) -> Result<(), HandlerError>;

    /// Whether the handler is removed from the registry once it matched.
    ///
    /// Checked right after matching, not after [`Handler::run`] finished.
    fn check_delete(&self) -> bool {
        false
    }
}

/// The ordered list of handlers of a stream.
///
/// All insertions, removals and match queries happen under one lock, so a
/// match never iterates a list which is modified concurrently.
#[derive(Default)]
pub struct Registry {
    handlers: Mutex<Vec<Arc<dyn Handler>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn Handler>>> {
        // A panicking handler never runs while this lock is held, so the
        // list cannot be poisoned in a half-updated state.
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `handler`.
    ///
    /// Registering the same handler twice, or a second handler under a name
    /// already in use, is ignored and returns `false`.
    pub fn register(&self, handler: Arc<dyn Handler>) -> bool {
        let mut handlers = self.lock();
        if handlers
            .iter()
            .any(|h| Arc::ptr_eq(h, &handler) || h.name() == handler.name())
        {
            log::debug!("handler {:?} is already registered", handler.name());
            return false;
        }
        handlers.push(handler);
        true
    }

    /// Remove the first handler called `name`.
    pub fn remove(&self, name: &str) -> bool {
        let mut handlers = self.lock();
        match handlers.iter().position(|h| h.name() == name) {
            Some(idx) => {
                handlers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Whether a handler called `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().iter().any(|h| h.name() == name)
    }

    /// Names of all handlers, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|h| h.name().to_owned()).collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All handlers accepting `stanza`, in registration order.
    ///
    /// One-shot handlers ([`Handler::check_delete`]) are removed from the
    /// registry before this returns.
    pub fn take_matches(&self, stanza: &Stanza) -> Vec<Arc<dyn Handler>> {
        let mut handlers = self.lock();
        let mut matched = Vec::new();
        handlers.retain(|handler| {
            if !handler.matches(stanza) {
                return true;
            }
            matched.push(handler.clone());
            !handler.check_delete()
        });
        matched
    }
}
