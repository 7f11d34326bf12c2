// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # The stream engine
//!
//! An [`XmppStream`] owns one connection and the tasks around it:
//!
//! - the read loop, parsing the socket and dispatching stanzas,
//! - `handler_threads` workers running handlers and scheduled callbacks,
//! - the sender, the only task writing to the socket,
//! - the scheduler.
//!
//! The handle is cheap to clone; every clone refers to the same connection.
//!
//! ```no_run
//! use std::sync::Arc;
//! use xmpp_engine::handler::{matcher::NameMatcher, Callback};
//! use xmpp_engine::{Config, XmppStream};
//!
//! # async fn run() {
//! let stream = XmppStream::new(Config::client("capulet.lit"));
//! stream.register_handler(Arc::new(Callback::new(
//!     "log messages",
//!     NameMatcher::new("message"),
//!     |_, stanza| {
//!         println!("{:?}", stanza.element().text());
//!         Ok(())
//!     },
//! )));
//! if stream.connect(("capulet.lit", 5222), false, true).await {
//!     stream.process(true).await;
//! }
//! # }
//! ```

use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connect::{tls, Address, Connector, TcpConnector, Transport};
use crate::event::{Event, Phase, StreamEvent, TaskFn};
use crate::handler::{matcher::IdMatcher, Handler, Registry, Waiter};
use crate::minidom::Element;
use crate::plugin::Plugin;
use crate::scheduler::{self, Scheduler};
use crate::stanza::{make_id, serialize, Extension, StanzaKind, StanzaTypes};
use crate::state::{Condition, StateMachine};
use crate::{Config, Error, HandlerError, Stanza};

mod reader;
#[cfg(test)]
mod tests;
mod workers;

/// Hook run when the peer opens its stream root; an error ends the
/// connection attempt.
pub type StreamStartFn = dyn Fn(&XmppStream, &Element) -> Result<(), Error> + Send + Sync;

type ReadSlot = BufReader<ReadHalf<Transport>>;

enum Outgoing {
    Data(String),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    config: Config,
    state: StateMachine,
    handlers: Registry,
    stanza_types: RwLock<StanzaTypes>,
    connector: Box<dyn Connector>,
    stream_start: Option<Box<StreamStartFn>>,

    scheduler: Scheduler,
    scheduler_rx: Mutex<Option<mpsc::UnboundedReceiver<scheduler::Command>>>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>>,
    send_tx: mpsc::UnboundedSender<Outgoing>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,

    running: watch::Sender<bool>,
    // Bumped on every teardown, aborting any read on the old socket, and
    // whenever a new socket is installed.
    generation: watch::Sender<u64>,
    phase: watch::Sender<Phase>,
    lifecycle: broadcast::Sender<StreamEvent>,

    reader: tokio::sync::Mutex<Option<ReadSlot>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<Transport>>>,
    address: Mutex<Option<Address>>,
    use_ssl: Mutex<bool>,
    use_tls: Mutex<bool>,

    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Construction-time collaborators of an [`XmppStream`].
pub struct XmppStreamBuilder {
    config: Config,
    connector: Box<dyn Connector>,
    stanza_types: StanzaTypes,
    stream_start: Option<Box<StreamStartFn>>,
}

impl XmppStreamBuilder {
    /// Use `connector` instead of plain TCP.
    pub fn connector<C: Connector>(mut self, connector: C) -> Self {
        self.connector = Box::new(connector);
        self
    }

    /// Use these stanza kinds instead of [`StanzaTypes::xmpp`].
    pub fn stanza_types(mut self, stanza_types: StanzaTypes) -> Self {
        self.stanza_types = stanza_types;
        self
    }

    /// Validate the peer's stream root, e.g. its version.
    pub fn stream_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&XmppStream, &Element) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.stream_start = Some(Box::new(f));
        self
    }

    /// Create the stream. No task is started before
    /// [`XmppStream::process`].
    pub fn build(self) -> XmppStream {
        let (scheduler, scheduler_rx) = Scheduler::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = broadcast::channel(64);
        XmppStream {
            inner: Arc::new(Inner {
                config: self.config,
                state: StateMachine::new(),
                handlers: Registry::new(),
                stanza_types: RwLock::new(self.stanza_types),
                connector: self.connector,
                stream_start: self.stream_start,
                scheduler,
                scheduler_rx: Mutex::new(Some(scheduler_rx)),
                event_tx,
                event_rx: Arc::new(tokio::sync::Mutex::new(event_rx)),
                send_tx,
                send_rx: Mutex::new(Some(send_rx)),
                running: watch::channel(true).0,
                generation: watch::channel(0).0,
                phase: watch::channel(Phase::Disconnected).0,
                lifecycle,
                reader: tokio::sync::Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                address: Mutex::new(None),
                use_ssl: Mutex::new(false),
                use_tls: Mutex::new(false),
                plugins: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Handle to one XMPP connection and its tasks.
#[derive(Clone)]
pub struct XmppStream {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for XmppStream {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("XmppStream")
            .field("address", &*lock(&self.inner.address))
            .field("phase", &self.phase())
            .finish()
    }
}

impl XmppStream {
    /// Stream with default collaborators.
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    /// Start configuring a stream.
    pub fn builder(config: Config) -> XmppStreamBuilder {
        XmppStreamBuilder {
            config,
            connector: Box::new(TcpConnector),
            stanza_types: StanzaTypes::xmpp(),
            stream_start: None,
        }
    }

    /// The settings this stream was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Lifecycle conditions of the connection.
    pub fn state(&self) -> &StateMachine {
        &self.inner.state
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.inner.phase.send_replace(phase);
        if previous != phase {
            log::trace!("phase {:?} -> {:?}", previous, phase);
        }
    }

    /// Receive lifecycle notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.lifecycle.subscribe()
    }

    fn emit(&self, event: StreamEvent) {
        log::debug!("stream event: {:?}", event);
        // Nobody listening is fine.
        let _ = self.inner.lifecycle.send(event);
    }

    /// Whether the engine has not been stopped yet.
    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// The address of the last [`XmppStream::connect`] call.
    pub fn address(&self) -> Option<Address> {
        lock(&self.inner.address).clone()
    }

    /// Whether STARTTLS should be negotiated when offered.
    pub fn use_tls(&self) -> bool {
        *lock(&self.inner.use_tls)
    }

    /// Whether the socket is wrapped in TLS before the stream opens.
    pub fn use_ssl(&self) -> bool {
        *lock(&self.inner.use_ssl)
    }

    /// Connect to `address`.
    ///
    /// While the reconnect condition is set, failed attempts are retried
    /// forever with `reconnect_delay` in between; otherwise the first
    /// failure returns `false`.
    pub async fn connect<A: Into<Address>>(&self, address: A, use_ssl: bool, use_tls: bool) -> bool {
        let address = address.into();
        *lock(&self.inner.address) = Some(address.clone());
        *lock(&self.inner.use_ssl) = use_ssl;
        *lock(&self.inner.use_tls) = use_tls;
        self.inner.state.set(Condition::IsClient, true);
        self.connect_loop(&address).await
    }

    async fn connect_loop(&self, address: &Address) -> bool {
        let state = &self.inner.state;
        if state.get(Condition::Connected) {
            log::debug!("already connected");
            return true;
        }
        loop {
            if !self.is_running() {
                return false;
            }
            self.set_phase(Phase::Connecting);
            match self.open(address).await {
                Ok(()) if !self.is_running() => {
                    log::debug!("stopped while connecting to {}", address);
                    self.teardown().await;
                    return false;
                }
                Ok(()) => {
                    log::info!("Connected to {}", address);
                    state.set(Condition::Connected, true);
                    self.emit(StreamEvent::Connected);
                    return true;
                }
                Err(e) => {
                    self.set_phase(Phase::Disconnected);
                    if !state.get(Condition::Reconnect) {
                        log::error!("Failed to connect to {}: {}", address, e);
                        return false;
                    }
                    log::error!(
                        "Failed to connect: {}. Retrying in {:?}.",
                        e,
                        self.inner.config.reconnect_delay
                    );
                    tokio::time::sleep(self.inner.config.reconnect_delay).await;
                }
            }
        }
    }

    async fn open(&self, address: &Address) -> Result<(), Error> {
        let mut transport = self.inner.connector.connect(address).await?;
        if self.use_ssl() {
            log::debug!("Socket wrapped for SSL");
            transport = tls::wrap(transport, &address.host, &self.inner.config).await?;
            self.inner.state.set(Condition::Ssl, true);
        }
        let (rx, tx) = tokio::io::split(transport);
        *self.inner.reader.lock().await = Some(BufReader::new(rx));
        let mut writer = self.inner.writer.lock().await;
        *writer = Some(tx);
        // Writes begun on an older socket see a changed generation.
        self.inner.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    /// Wait `reconnect_delay`, then connect again to the last address.
    pub async fn reconnect(&self) -> bool {
        self.inner.state.set(Condition::Tls, false);
        self.inner.state.set(Condition::Ssl, false);
        tokio::time::sleep(self.inner.config.reconnect_delay).await;
        match self.address() {
            Some(address) => self.connect_loop(&address).await,
            None => {
                log::warn!("cannot reconnect, never connected");
                false
            }
        }
    }

    /// Start the scheduler, the handler workers, the sender and the read
    /// loop.
    ///
    /// With `blocking`, this returns once the read loop ended for good;
    /// otherwise right away. Starting a stream twice does nothing.
    pub async fn process(&self, blocking: bool) {
        let (Some(scheduler_rx), Some(send_rx)) = (
            lock(&self.inner.scheduler_rx).take(),
            lock(&self.inner.send_rx).take(),
        ) else {
            log::warn!("stream is already processing");
            return;
        };

        let plugins: Vec<Arc<dyn Plugin>> = lock(&self.inner.plugins).clone();
        for plugin in plugins {
            plugin.post_init(self);
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(scheduler::run(
            scheduler_rx,
            self.inner.event_tx.clone(),
            self.inner.running.subscribe(),
        )));
        for index in 0..self.inner.config.handler_threads.max(1) {
            log::debug!("Starting handler worker {}", index);
            tasks.push(tokio::spawn(self.clone().event_runner(index)));
        }
        tasks.push(tokio::spawn(self.clone().send_loop(send_rx)));

        if blocking {
            lock(&self.inner.tasks).extend(tasks);
            self.read_loop().await;
        } else {
            tasks.push(tokio::spawn({
                let stream = self.clone();
                async move { stream.read_loop().await }
            }));
            lock(&self.inner.tasks).extend(tasks);
        }
    }

    /// Wait for every task started by [`XmppStream::process`] to end.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("stream task failed: {}", e);
            }
        }
    }

    /// Close the stream.
    ///
    /// The footer is sent and given `disconnect_grace` to be written, then
    /// the socket is torn down. Without `reconnect`, the engine stops for
    /// good; with it, the read loop connects again.
    pub async fn disconnect(&self, reconnect: bool) {
        let state = &self.inner.state;
        state.set(Condition::Reconnect, reconnect);
        if state.get(Condition::Disconnecting) {
            return;
        }
        if !reconnect {
            log::debug!("Disconnecting...");
            state.set(Condition::Disconnecting, true);
        }
        self.set_phase(Phase::Closing);
        if state.get(Condition::Connected) {
            self.send_raw(self.inner.config.stream_footer.clone());
            let (done, flushed) = oneshot::channel();
            if self.inner.send_tx.send(Outgoing::Flush(done)).is_ok()
                && tokio::time::timeout(self.inner.config.disconnect_grace, flushed)
                    .await
                    .is_err()
            {
                log::debug!("footer not flushed in time");
            }
        }
        if !reconnect {
            self.inner.running.send_replace(false);
        }
        self.teardown().await;
        self.emit(StreamEvent::Disconnected { reconnect });
    }

    async fn teardown(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let grace = self.inner.config.disconnect_grace;
            match tokio::time::timeout(grace, writer.shutdown()).await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => log::debug!("error while closing socket: {}", e),
                Err(_) => log::debug!("socket shutdown timed out"),
            }
        }
        self.inner.reader.lock().await.take();
        self.inner.state.set(Condition::Connected, false);
        self.set_phase(Phase::Disconnected);
    }

    /// Queue `data` for the sender. Never blocks; the write itself is best
    /// effort.
    pub fn send_raw<S: Into<String>>(&self, data: S) -> bool {
        match self.inner.send_tx.send(Outgoing::Data(data.into())) {
            Ok(()) => true,
            Err(_) => {
                log::warn!("send queue is closed");
                false
            }
        }
    }

    /// Serialise `element` and queue it.
    pub fn send_element(&self, element: &Element) -> Result<(), Error> {
        let data = serialize(element)?;
        if self.send_raw(data) {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    /// Send an `<iq/>` and wait for the stanza carrying the same id.
    ///
    /// An id is generated if `iq` has none. Waits `response_timeout` unless
    /// `timeout` is given.
    pub async fn send_iq(&self, mut iq: Element, timeout: Option<Duration>) -> Result<Stanza, Error> {
        let id = match iq.attr("id") {
            Some(id) => id.to_owned(),
            None => {
                let id = make_id();
                iq.set_attr("id", id.clone());
                id
            }
        };
        let waiter = Arc::new(Waiter::new(format!("IqWait_{}", id), IdMatcher(id)));
        self.register_handler(waiter.clone());
        if let Err(e) = self.send_element(&iq) {
            self.remove_handler(waiter.name());
            return Err(e);
        }
        let timeout = timeout.unwrap_or(self.inner.config.response_timeout);
        waiter.wait(self, timeout).await.ok_or(Error::Timeout)
    }

    /// Add a handler; see [`Registry::register`].
    pub fn register_handler(&self, handler: Arc<dyn Handler>) -> bool {
        self.inner.handlers.register(handler)
    }

    /// Remove the handler called `name`.
    pub fn remove_handler(&self, name: &str) -> bool {
        self.inner.handlers.remove(name)
    }

    /// The handler registry.
    pub fn handlers(&self) -> &Registry {
        &self.inner.handlers
    }

    /// Run `callback` on a handler worker after `delay`, and every `delay`
    /// after that if `repeat` is set.
    pub fn schedule<F>(&self, name: &str, delay: Duration, callback: F, repeat: bool)
    where
        F: Fn(&XmppStream) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let callback: Arc<TaskFn> = Arc::new(callback);
        self.inner.scheduler.add(name, delay, callback, repeat);
    }

    /// Cancel the scheduled task called `name`.
    pub fn unschedule(&self, name: &str) {
        self.inner.scheduler.remove(name);
    }

    /// Register a stanza kind for this stream.
    pub fn register_stanza<K: StanzaKind + 'static>(&self, kind: K) {
        self.inner
            .stanza_types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(kind);
    }

    /// Remove the stanza kind for `name`.
    pub fn remove_stanza(&self, name: &str) -> bool {
        self.inner
            .stanza_types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    /// Register an extension element of the stanza kind `stanza`.
    pub fn register_stanza_extension(&self, stanza: &str, extension: Extension) {
        self.inner
            .stanza_types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register_extension(stanza, extension);
    }

    /// Remove an extension registration.
    pub fn remove_stanza_extension(&self, stanza: &str, name: &str) -> bool {
        self.inner
            .stanza_types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_extension(stanza, name)
    }

    fn build_stanza(&self, element: Element) -> Stanza {
        self.inner
            .stanza_types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .build(element, &self.inner.config.default_ns)
    }

    /// Initialise `plugin` and keep it; a plugin with the same name is
    /// not registered twice.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), Error> {
        if self.plugin(plugin.name()).is_some() {
            log::debug!("plugin {} is already registered", plugin.name());
            return Ok(());
        }
        plugin.init(self)?;
        log::debug!("Loaded plugin {}", plugin.name());
        lock(&self.inner.plugins).push(plugin);
        Ok(())
    }

    /// The registered plugin called `name`.
    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        lock(&self.inner.plugins)
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }
}
