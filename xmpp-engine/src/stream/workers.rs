// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::{Outgoing, XmppStream};
use crate::event::{Event, ScheduledCall, StreamEvent};
use crate::handler::Handler;
use crate::state::Condition;
use crate::{HandlerError, Stanza};

fn call_guarded<F: FnOnce() -> Result<(), HandlerError>>(f: F) -> Result<(), HandlerError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::from_panic(payload)),
    }
}

impl XmppStream {
    /// Body of the sender: the only place writing to the socket.
    pub(super) async fn send_loop(self, mut queue: mpsc::UnboundedReceiver<Outgoing>) {
        let mut running = self.inner.running.subscribe();
        loop {
            let item = tokio::select! {
                biased;
                item = queue.recv() => item,
                _ = running.wait_for(|running| !*running) => None,
            };
            let Some(item) = item else {
                break;
            };
            match item {
                Outgoing::Flush(done) => {
                    if let Some(tx) = self.inner.writer.lock().await.as_mut() {
                        if let Err(e) = tx.flush().await {
                            log::debug!("flush failed: {}", e);
                        }
                    }
                    let _ = done.send(());
                }
                Outgoing::Data(data) => {
                    log::debug!("SEND: {}", data);
                    let mut writer = self.inner.writer.lock().await;
                    let Some(tx) = writer.as_mut() else {
                        log::warn!("Failed to send {}: not connected", data);
                        continue;
                    };
                    let generation = *self.inner.generation.borrow();
                    let result = match tx.write_all(data.as_bytes()).await {
                        Ok(()) => tx.flush().await,
                        Err(e) => Err(e),
                    };
                    drop(writer);
                    if let Err(e) = result {
                        log::warn!("Failed to send {}: {}", data, e);
                        if *self.inner.generation.borrow() != generation {
                            log::debug!("socket was replaced meanwhile, not tearing down");
                            continue;
                        }
                        self.inner.state.set(Condition::Connected, false);
                        if self.inner.state.get(Condition::Reconnect) {
                            log::error!("Disconnected. Socket error.");
                            self.teardown().await;
                            self.emit(StreamEvent::Disconnected { reconnect: true });
                        }
                    }
                }
            }
        }
        log::debug!("sender stopped");
    }

    /// Body of a handler worker.
    pub(super) async fn event_runner(self, index: usize) {
        log::debug!("Loading event runner {}", index);
        let queue = self.inner.event_rx.clone();
        let poll = self.inner.config.event_poll_timeout;
        while self.is_running() {
            let event = {
                let mut queue = queue.lock().await;
                tokio::time::timeout(poll, queue.recv()).await
            };
            let event = match event {
                Ok(Some(event)) => event,
                Ok(None) => break,
                // Nothing arrived: look at the run flag again.
                Err(_) => continue,
            };
            match event {
                Event::Stanza(handler, stanza) => self.run_handler(handler, stanza).await,
                Event::Schedule(call) => self.run_scheduled(call).await,
                Event::Quit => {
                    log::debug!("Quitting event runner {}", index);
                    break;
                }
            }
        }
    }

    async fn run_handler(&self, handler: Arc<dyn Handler>, mut stanza: Stanza) {
        let stream = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            let result = call_guarded(|| handler.run(&stream, &mut stanza));
            if let Err(ref e) = result {
                log::error!("Error processing event handler {}: {}", handler.name(), e);
                let kind = stanza.kind().clone();
                kind.exception(&stream, &stanza, e);
            }
        })
        .await;
        if let Err(e) = result {
            log::error!("handler task failed: {}", e);
        }
    }

    async fn run_scheduled(&self, call: ScheduledCall) {
        log::debug!(
            "running scheduled task {} ({:?} late)",
            call.name,
            call.queued.saturating_duration_since(call.nominal)
        );
        let stream = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            if let Err(e) = call_guarded(|| (*call.callback)(&stream)) {
                log::error!("Error processing scheduled task {}: {}", call.name, e);
            }
        })
        .await;
        if let Err(e) = result {
            log::error!("scheduled task failed: {}", e);
        }
    }
}
