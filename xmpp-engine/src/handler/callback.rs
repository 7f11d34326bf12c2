// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::{Directive, Handler, Matcher};
use crate::{HandlerError, Stanza, XmppStream};

type RunFn = dyn Fn(&XmppStream, &mut Stanza) -> Result<(), HandlerError> + Send + Sync;
type PrerunFn = dyn Fn(&XmppStream, &Stanza) -> Directive + Send + Sync;

/// Handler calling closures.
///
/// The worker closure receives the handler's own copy of the stanza and may
/// mutate it freely. An optional in-stream closure runs on the read loop
/// first and may steer the stream.
pub struct Callback {
    name: String,
    matcher: Box<dyn Matcher>,
    run: Option<Box<RunFn>>,
    prerun: Option<Box<PrerunFn>>,
    once: bool,
}

impl Callback {
    /// Handler running `f` on a handler worker.
    pub fn new<S, M, F>(name: S, matcher: M, f: F) -> Self
    where
        S: Into<String>,
        M: Matcher + 'static,
        F: Fn(&XmppStream, &mut Stanza) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matcher: Box::new(matcher),
            run: Some(Box::new(f)),
            prerun: None,
            once: false,
        }
    }

    /// Handler running `f` only on the read loop.
    pub fn in_stream<S, M, F>(name: S, matcher: M, f: F) -> Self
    where
        S: Into<String>,
        M: Matcher + 'static,
        F: Fn(&XmppStream, &Stanza) -> Directive + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matcher: Box::new(matcher),
            run: None,
            prerun: Some(Box::new(f)),
            once: false,
        }
    }

    /// Additionally run `f` on the read loop before the stanza is queued.
    pub fn with_prerun<F>(mut self, f: F) -> Self
    where
        F: Fn(&XmppStream, &Stanza) -> Directive + Send + Sync + 'static,
    {
        self.prerun = Some(Box::new(f));
        self
    }

    /// Remove the handler from the registry after its first match.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

impl Handler for Callback {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, stanza: &Stanza) -> bool {
        self.matcher.matches(stanza)
    }

    fn prerun(&self, stream: &XmppStream, stanza: &Stanza) -> Directive {
        match self.prerun {
            Some(ref f) => f(stream, stanza),
            None => Directive::Continue,
        }
    }

    fn run(&self, stream: &XmppStream, stanza: &mut Stanza) -> Result<(), HandlerError> {
        match self.run {
            Some(ref f) => f(stream, stanza),
            None => Ok(()),
        }
    }

    fn check_delete(&self) -> bool {
        self.once
    }
}
