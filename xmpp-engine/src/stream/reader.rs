// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use tokio::sync::watch;

use super::{ReadSlot, XmppStream};
use crate::connect::tls;
use crate::event::{Event, Phase, StreamEvent};
use crate::handler::Directive;
use crate::minidom::Element;
use crate::state::Condition;
use crate::xmlstream::{ParseStep, StanzaReader, StreamDelegate};
use crate::Error;

/// Why a connection attempt stopped reading.
enum SessionEnd {
    /// The peer closed the stream root, or a handler asked to close.
    Closed,
    /// The socket was torn down by someone else, or the engine stopped.
    Aborted,
}

/// Why one stream on a socket stopped.
enum StreamEnd {
    Closed,
    Aborted,
    StartTls,
    Fatal(Error),
}

/// Turns parser callbacks into stanza dispatch.
struct Dispatcher<'a> {
    stream: &'a XmppStream,
}

impl StreamDelegate for Dispatcher<'_> {
    fn stream_start(&mut self, root: &Element) -> Result<(), Error> {
        if let Some(ref hook) = self.stream.inner.stream_start {
            hook(self.stream, root)?;
        }
        log::debug!("stream opened by peer");
        self.stream.set_phase(Phase::Processing);
        self.stream.emit(StreamEvent::StreamStart);
        Ok(())
    }

    fn stanza(&mut self, element: Element) -> Directive {
        self.stream.dispatch(element)
    }
}

impl XmppStream {
    /// Body of the read loop: one iteration per connection attempt.
    pub(super) async fn read_loop(&self) {
        let state = &self.inner.state;
        let mut first = true;
        while self.is_running() && (first || state.get(Condition::Reconnect)) {
            first = false;
            state.set(Condition::Processing, true);
            match self.session().await {
                Ok(SessionEnd::Closed) => {
                    log::debug!("Ending read loop");
                    self.disconnect(state.get(Condition::Reconnect)).await;
                }
                Ok(SessionEnd::Aborted) => (),
                Err(e) => {
                    self.set_phase(Phase::Failed);
                    state.set(Condition::Processing, false);
                    if state.get(Condition::Reconnect) {
                        log::error!("Connection error: {}. Reconnecting.", e);
                        self.disconnect(true).await;
                    } else {
                        log::error!("Connection error: {}", e);
                        self.disconnect(false).await;
                    }
                }
            }
            state.set(Condition::Processing, false);
            if self.is_running() && state.get(Condition::Reconnect) && !self.reconnect().await {
                break;
            }
        }
        state.set(Condition::Processing, false);
        self.inner.running.send_replace(false);
        self.teardown().await;
        for _ in 0..self.inner.config.handler_threads.max(1) {
            let _ = self.inner.event_tx.send(Event::Quit);
        }
        self.emit(StreamEvent::Quit);
        log::debug!("read loop stopped");
    }

    /// Read from the current socket until it is closed, aborted or broken.
    async fn session(&self) -> Result<SessionEnd, Error> {
        let mut generation = self.inner.generation.subscribe();
        let current = *generation.borrow_and_update();
        let mut running = self.inner.running.subscribe();
        let Some(mut io) = self.inner.reader.lock().await.take() else {
            return Err(Error::NotConnected);
        };
        loop {
            match self
                .read_stream(&mut io, &mut generation, current, &mut running)
                .await
            {
                StreamEnd::Closed => return Ok(SessionEnd::Closed),
                StreamEnd::Aborted => return Ok(SessionEnd::Aborted),
                StreamEnd::Fatal(e) => return Err(e),
                StreamEnd::StartTls => {
                    io = tokio::select! {
                        io = self.upgrade(io) => io?,
                        _ = generation.wait_for(|g| *g != current) => {
                            return Ok(SessionEnd::Aborted)
                        }
                    };
                }
            }
        }
    }

    /// Parse one stream on `io`, from its header up to its end or a TLS
    /// upgrade.
    async fn read_stream(
        &self,
        io: &mut ReadSlot,
        generation: &mut watch::Receiver<u64>,
        current: u64,
        running: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let mut reader = StanzaReader::new(io);
        let mut dispatcher = Dispatcher { stream: self };
        self.open_stream();
        loop {
            let step = tokio::select! {
                step = reader.step(&mut dispatcher) => step,
                _ = generation.wait_for(|g| *g != current) => return StreamEnd::Aborted,
                _ = running.wait_for(|running| !*running) => return StreamEnd::Aborted,
            };
            match step {
                ParseStep::Continue => (),
                ParseStep::Restart => {
                    self.set_phase(Phase::Restarting);
                    self.open_stream();
                }
                ParseStep::StartTls => return StreamEnd::StartTls,
                ParseStep::Closed => return StreamEnd::Closed,
                ParseStep::Fatal(e) => {
                    log::debug!(
                        "stream {:?} failed at depth {}",
                        reader.root().and_then(|root| root.attr("id")),
                        reader.depth()
                    );
                    return StreamEnd::Fatal(e);
                }
            }
        }
    }

    fn open_stream(&self) {
        if self.inner.state.get(Condition::IsClient) {
            self.send_raw(self.inner.config.stream_header.clone());
        }
        self.set_phase(Phase::StreamOpen);
    }

    /// Replace the socket by a TLS session over it.
    ///
    /// The write half is held for the whole handshake, so the sender cannot
    /// interleave plain text with it.
    async fn upgrade(&self, io: ReadSlot) -> Result<ReadSlot, Error> {
        log::info!("Negotiating TLS");
        let address = self.address().ok_or(Error::NotConnected)?;
        let mut writer = self.inner.writer.lock().await;
        let tx = writer.take().ok_or(Error::NotConnected)?;
        let transport = io.into_inner().unsplit(tx);
        let transport = tls::wrap(transport, &address.host, &self.inner.config).await?;
        let (rx, tx) = tokio::io::split(transport);
        *writer = Some(tx);
        self.inner.state.set(Condition::Tls, true);
        Ok(ReadSlot::new(rx))
    }

    /// Build the stanza for `element` and hand a copy to every matching
    /// handler.
    pub(super) fn dispatch(&self, element: Element) -> Directive {
        let stanza = self.build_stanza(element);
        if log::log_enabled!(log::Level::Debug) {
            match stanza.to_xml() {
                Ok(xml) => log::debug!("RECV: {}", xml),
                Err(e) => log::debug!("RECV: <{}/> ({})", stanza.name(), e),
            }
        }

        let matched = self.inner.handlers.take_matches(&stanza);
        if matched.is_empty() {
            let kind = stanza.kind().clone();
            kind.unhandled(self, &stanza);
            return Directive::Continue;
        }

        let mut directive = Directive::Continue;
        for handler in matched {
            let copy = stanza.clone();
            directive = directive.or(handler.prerun(self, &copy));
            if self.inner.event_tx.send(Event::Stanza(handler, copy)).is_err() {
                log::warn!("event queue is closed, dropping stanza");
            }
        }
        directive
    }
}
