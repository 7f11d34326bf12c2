// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::handler::Handler;
use crate::{HandlerError, Stanza, XmppStream};

/// Callback of a scheduled task. Arguments are captured by the closure.
pub type TaskFn = dyn Fn(&XmppStream) -> Result<(), HandlerError> + Send + Sync;

/// A scheduled task whose deadline passed.
pub(crate) struct ScheduledCall {
    pub(crate) name: String,
    pub(crate) callback: Arc<TaskFn>,
    /// When the task was due.
    pub(crate) nominal: Instant,
    /// When the event was pushed onto the queue.
    pub(crate) queued: Instant,
}

impl fmt::Debug for ScheduledCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScheduledCall")
            .field("name", &self.name)
            .field("nominal", &self.nominal)
            .field("queued", &self.queued)
            .finish()
    }
}

/// Unit of work for the handler workers.
pub(crate) enum Event {
    /// Run a handler on its own copy of a stanza.
    Stanza(Arc<dyn Handler>, Stanza),
    /// Run a scheduled callback.
    Schedule(ScheduledCall),
    /// Stop one worker.
    Quit,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::Stanza(handler, stanza) => f
                .debug_tuple("Stanza")
                .field(&handler.name())
                .field(stanza)
                .finish(),
            Event::Schedule(call) => f.debug_tuple("Schedule").field(call).finish(),
            Event::Quit => f.write_str("Quit"),
        }
    }
}

/// Lifecycle notification, see [`XmppStream::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A socket was established.
    Connected,
    /// The peer opened its stream root.
    StreamStart,
    /// The socket was torn down.
    Disconnected {
        /// Whether a new connection will be attempted.
        reconnect: bool,
    },
    /// The engine stopped for good.
    Quit,
}

impl StreamEvent {
    /// `Disconnected` event?
    pub fn is_disconnected(&self) -> bool {
        matches!(self, StreamEvent::Disconnected { .. })
    }
}

/// Where the connection currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No socket.
    Disconnected,
    /// Establishing the socket.
    Connecting,
    /// Socket up, stream header sent, waiting for the peer's root.
    StreamOpen,
    /// Reading stanzas.
    Processing,
    /// Parser reset in progress.
    Restarting,
    /// Orderly teardown in progress.
    Closing,
    /// The last attempt failed on a socket or parse error.
    Failed,
}
