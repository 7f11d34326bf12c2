// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::time::Duration;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::{Directive, Handler, Matcher};
use crate::{HandlerError, Stanza, XmppStream};

/// One-shot handler handing the first matching stanza to a waiting task.
///
/// The stanza is delivered from the read loop, so a waiter completes even
/// while every handler worker is busy.
pub struct Waiter {
    name: String,
    matcher: Box<dyn Matcher>,
    tx: Mutex<Option<oneshot::Sender<Stanza>>>,
    rx: Mutex<Option<oneshot::Receiver<Stanza>>>,
}

impl Waiter {
    /// Create a waiter; register it before sending whatever triggers the
    /// expected stanza.
    pub fn new<S: Into<String>, M: Matcher + 'static>(name: S, matcher: M) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            name: name.into(),
            matcher: Box::new(matcher),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Wait for the stanza.
    ///
    /// On timeout, the waiter removes itself from `stream` and `None` is
    /// returned. Only the first call can ever yield a stanza.
    pub async fn wait(&self, stream: &XmppStream, timeout: Duration) -> Option<Stanza> {
        let rx = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(stanza)) => Some(stanza),
            Ok(Err(_)) => None,
            Err(_) => {
                log::warn!("timed out waiting for {}", self.name);
                stream.remove_handler(&self.name);
                None
            }
        }
    }
}

impl Handler for Waiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, stanza: &Stanza) -> bool {
        self.matcher.matches(stanza)
    }

    fn prerun(&self, _stream: &XmppStream, stanza: &Stanza) -> Directive {
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // The waiting side may already have given up.
            let _ = tx.send(stanza.clone());
        }
        Directive::Continue
    }

    fn run(&self, _stream: &XmppStream, _stanza: &mut Stanza) -> Result<(), HandlerError> {
        Ok(())
    }

    fn check_delete(&self) -> bool {
        true
    }
}
