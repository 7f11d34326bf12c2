// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::XmppStream;
use crate::connect::{Address, Connector, Transport};
use crate::event::{Phase, StreamEvent};
use crate::handler::matcher::NameMatcher;
use crate::handler::Callback;
use crate::minidom::Element;
use crate::plugin::{Ping, StartTls};
use crate::stanza::{StanzaKind, StanzaTypes};
use crate::state::Condition;
use crate::{Config, Error, Stanza};

const WAIT: Duration = Duration::from_secs(5);

/// Hands out in-memory sockets, refusing the first `failures` attempts.
struct Loopback {
    attempts: Arc<AtomicUsize>,
    failures: usize,
    peers: mpsc::UnboundedSender<DuplexStream>,
    /// How long every attempt after the first one takes.
    slow: Option<Duration>,
    /// Writes on the first socket fail once this is armed.
    fault: Option<Arc<WriteFault>>,
}

impl Connector for Loopback {
    fn connect<'a>(&'a self, _address: &'a Address) -> BoxFuture<'a, io::Result<Transport>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            if let Some(delay) = self.slow.filter(|_| attempt > 1) {
                tokio::time::sleep(delay).await;
            }
            let (client, server) = tokio::io::duplex(4096);
            let _ = self.peers.send(server);
            let transport: Transport = match self.fault {
                Some(ref fault) if attempt == 1 => Box::new(Faulty {
                    inner: client,
                    fault: fault.clone(),
                }),
                _ => Box::new(client),
            };
            Ok(transport)
        })
    }
}

#[derive(Default)]
struct WriteFault {
    armed: AtomicBool,
    // Held writes stay pending until this resolves, then fail.
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl WriteFault {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn arm_held(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(gate);
        self.arm();
        release
    }
}

struct Faulty {
    inner: DuplexStream,
    fault: Arc<WriteFault>,
}

impl AsyncRead for Faulty {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Faulty {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.fault.armed.load(Ordering::SeqCst) {
            return Pin::new(&mut self.inner).poll_write(cx, buf);
        }
        let mut gate = self.fault.gate.lock().unwrap();
        if let Some(ref mut held) = *gate {
            if Pin::new(held).poll(cx).is_pending() {
                return Poll::Pending;
            }
            *gate = None;
        }
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn loopback(failures: usize) -> (Loopback, Arc<AtomicUsize>, mpsc::UnboundedReceiver<DuplexStream>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let (peers, rx) = mpsc::unbounded_channel();
    let connector = Loopback {
        attempts: attempts.clone(),
        failures,
        peers,
        slow: None,
        fault: None,
    };
    (connector, attempts, rx)
}

async fn within<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(WAIT, f).await.expect("timed out")
}

/// Read from the peer side until `needle` shows up; returns all text read.
async fn read_until(peer: &mut DuplexStream, needle: &str) -> String {
    let mut seen = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let text = String::from_utf8_lossy(&seen).into_owned();
        if text.contains(needle) {
            return text;
        }
        let n = peer.read(&mut buf).await.unwrap();
        assert!(n > 0, "peer closed before {:?} arrived, got {:?}", needle, text);
        seen.extend_from_slice(&buf[..n]);
    }
}

async fn next_event<F: Fn(&StreamEvent) -> bool>(
    events: &mut broadcast::Receiver<StreamEvent>,
    wanted: F,
) -> StreamEvent {
    within(async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("lifecycle channel: {}", e),
            }
        }
    })
    .await
}

/// Connect, start processing and return the peer side of the socket once
/// the stream header arrived.
async fn open(stream: &XmppStream, peers: &mut mpsc::UnboundedReceiver<DuplexStream>) -> DuplexStream {
    assert!(stream.connect(("loopback", 5222), false, false).await);
    stream.process(false).await;
    let mut peer = within(peers.recv()).await.unwrap();
    within(read_until(&mut peer, "<stream>")).await;
    peer
}

async fn shutdown(stream: &XmppStream, events: &mut broadcast::Receiver<StreamEvent>) {
    stream.disconnect(false).await;
    next_event(events, |e| *e == StreamEvent::Quit).await;
    within(stream.join()).await;
    assert!(!stream.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stanza_dispatch_then_reconnect() {
    let (connector, attempts, mut peers) = loopback(0);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    let (tx, mut received) = mpsc::unbounded_channel();
    stream.register_handler(Arc::new(Callback::new(
        "messages",
        NameMatcher::new("message"),
        move |_, stanza| {
            let _ = tx.send(stanza.element().text());
            Ok(())
        },
    )));
    let mut events = stream.subscribe();

    let mut peer = open(&stream, &mut peers).await;
    peer.write_all(b"<stream><message>hi</message></stream>")
        .await
        .unwrap();

    assert_eq!(within(received.recv()).await.as_deref(), Some("hi"));
    next_event(&mut events, |e| *e == StreamEvent::Disconnected { reconnect: true }).await;
    within(read_until(&mut peer, "</stream>")).await;

    let mut second = within(peers.recv()).await.unwrap();
    within(read_until(&mut second, "<stream>")).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    shutdown(&stream, &mut events).await;
    assert!(received.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn connect_retries_with_fixed_delay() {
    let (connector, attempts, _peers) = loopback(3);
    let config = Config::default().tight();
    let delay = config.reconnect_delay;
    let stream = XmppStream::builder(config).connector(connector).build();

    let start = tokio::time::Instant::now();
    assert!(stream.connect(("loopback", 5222), false, false).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(start.elapsed() >= delay * 3);
    assert!(stream.state().get(Condition::Connected));
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_without_reconnect() {
    let (connector, attempts, _peers) = loopback(1);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    stream.state().set(Condition::Reconnect, false);

    assert!(!stream.connect(("loopback", 5222), false, false).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(stream.phase(), Phase::Disconnected);
    assert!(!stream.state().get(Condition::Connected));
}

struct CountingMessages(Arc<AtomicUsize>);

impl StanzaKind for CountingMessages {
    fn name(&self) -> &str {
        "message"
    }

    fn unhandled(&self, _stream: &XmppStream, _stanza: &Stanza) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unhandled_hook_runs_once_per_stanza() {
    let unhandled = Arc::new(AtomicUsize::new(0));
    let mut types = StanzaTypes::xmpp();
    types.register(CountingMessages(unhandled.clone()));
    let (connector, _, mut peers) = loopback(0);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .stanza_types(types)
        .build();
    let (tx, mut done) = mpsc::unbounded_channel();
    stream.register_handler(Arc::new(Callback::new(
        "done",
        NameMatcher::new("done"),
        move |_, _| {
            let _ = tx.send(());
            Ok(())
        },
    )));
    let mut events = stream.subscribe();

    let mut peer = open(&stream, &mut peers).await;
    peer.write_all(b"<stream><message>a</message><message>b</message><done/>")
        .await
        .unwrap();
    within(done.recv()).await.unwrap();
    assert_eq!(unhandled.load(Ordering::SeqCst), 2);

    shutdown(&stream, &mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handlers_get_isolated_copies_and_survive_panics() {
    let (connector, _, mut peers) = loopback(0);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    stream.register_handler(Arc::new(Callback::new(
        "vandal",
        NameMatcher::new("message"),
        |_, stanza| {
            stanza.element_mut().set_attr("mutated", "yes".to_owned());
            panic!("vandal handler failed");
        },
    )));
    let (tx, mut pristine) = mpsc::unbounded_channel();
    stream.register_handler(Arc::new(Callback::new(
        "observer",
        NameMatcher::new("message"),
        move |_, stanza| {
            let _ = tx.send(stanza.attr("mutated").is_none());
            Ok(())
        },
    )));
    let mut events = stream.subscribe();

    let mut peer = open(&stream, &mut peers).await;
    peer.write_all(b"<stream><message>a</message>").await.unwrap();
    assert_eq!(within(pristine.recv()).await, Some(true));
    peer.write_all(b"<message>b</message>").await.unwrap();
    assert_eq!(within(pristine.recv()).await, Some(true));
    assert!(stream.handlers().contains("vandal"));

    shutdown(&stream, &mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_shot_handler_is_removed_after_first_match() {
    let (connector, _, mut peers) = loopback(0);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    let once = Arc::new(AtomicUsize::new(0));
    let counter = once.clone();
    stream.register_handler(Arc::new(
        Callback::new("once", NameMatcher::new("message"), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .once(),
    ));
    let (tx, mut seen) = mpsc::unbounded_channel();
    stream.register_handler(Arc::new(Callback::new(
        "always",
        NameMatcher::new("message"),
        move |_, _| {
            let _ = tx.send(());
            Ok(())
        },
    )));
    let mut events = stream.subscribe();

    let mut peer = open(&stream, &mut peers).await;
    peer.write_all(b"<stream><message>a</message><message>b</message>")
        .await
        .unwrap();
    within(seen.recv()).await.unwrap();
    within(seen.recv()).await.unwrap();
    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert!(!stream.handlers().contains("once"));
    assert!(stream.handlers().contains("always"));

    shutdown(&stream, &mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_iq_waits_for_matching_id() {
    let (connector, _, mut peers) = loopback(0);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    let mut events = stream.subscribe();
    let mut peer = open(&stream, &mut peers).await;
    peer.write_all(b"<stream>").await.unwrap();

    let server = tokio::spawn(async move {
        read_until(&mut peer, "q1").await;
        peer.write_all(b"<iq type='result' id='other'/><iq type='result' id='q1'/>")
            .await
            .unwrap();
        peer
    });
    let iq = Element::builder("iq", "")
        .attr("type", "get".to_owned())
        .attr("id", "q1".to_owned())
        .append(Element::builder("query", "jabber:iq:version").build())
        .build();
    let reply = within(stream.send_iq(iq, Some(Duration::from_secs(2))))
        .await
        .unwrap();
    assert_eq!(reply.id(), Some("q1"));
    assert_eq!(reply.type_(), Some("result"));
    assert!(!stream.handlers().contains("IqWait_q1"));
    let _peer = within(server).await.unwrap();

    let iq = Element::builder("iq", "")
        .attr("type", "get".to_owned())
        .attr("id", "q2".to_owned())
        .build();
    let result = stream.send_iq(iq, Some(Duration::from_millis(100))).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(!stream.handlers().contains("IqWait_q2"));

    shutdown(&stream, &mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_plugin_answers_pings() {
    let (connector, _, mut peers) = loopback(0);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    stream.register_plugin(Arc::new(Ping::new())).unwrap();
    stream.register_plugin(Arc::new(Ping::new())).unwrap();
    assert_eq!(stream.handlers().len(), 1);
    assert!(stream.plugin("xep_0199").is_some());
    let mut events = stream.subscribe();

    let mut peer = open(&stream, &mut peers).await;
    peer.write_all(
        b"<stream><iq type='get' id='p1' from='juliet@capulet.lit'><ping xmlns='urn:xmpp:ping'/></iq>",
    )
    .await
    .unwrap();
    let answer = within(read_until(&mut peer, "result")).await;
    assert!(answer.contains("p1"));
    assert!(answer.contains("juliet@capulet.lit"));

    shutdown(&stream, &mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn starttls_offer_is_taken_and_failure_closes() {
    let (connector, _, mut peers) = loopback(0);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    stream.register_plugin(Arc::new(StartTls)).unwrap();
    let mut events = stream.subscribe();

    assert!(stream.connect(("loopback", 5222), false, true).await);
    stream.process(false).await;
    let mut peer = within(peers.recv()).await.unwrap();
    within(read_until(&mut peer, "<stream>")).await;
    peer.write_all(
        b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams'>\
          <stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>",
    )
    .await
    .unwrap();
    within(read_until(&mut peer, "<starttls")).await;

    peer.write_all(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
        .await
        .unwrap();
    next_event(&mut events, |e| *e == StreamEvent::Disconnected { reconnect: true }).await;
    assert!(!stream.state().get(Condition::Tls));

    shutdown(&stream, &mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_tasks_run_until_stopped() {
    let (connector, _, mut peers) = loopback(0);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    let (tx, mut ticks) = mpsc::unbounded_channel();
    stream.schedule(
        "tick",
        Duration::from_millis(20),
        move |_| {
            let _ = tx.send(());
            Ok(())
        },
        true,
    );
    let mut events = stream.subscribe();

    assert!(stream.connect(("loopback", 5222), false, false).await);
    let runner = tokio::spawn({
        let stream = stream.clone();
        async move { stream.process(true).await }
    });
    let _peer = within(peers.recv()).await.unwrap();
    for _ in 0..3 {
        within(ticks.recv()).await.unwrap();
    }

    stream.disconnect(false).await;
    next_event(&mut events, |e| *e == StreamEvent::Quit).await;
    within(runner).await.unwrap();
    within(stream.join()).await;
    assert_eq!(stream.phase(), Phase::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_xml_reconnects() {
    let (connector, attempts, mut peers) = loopback(0);
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    let mut events = stream.subscribe();

    let mut peer = open(&stream, &mut peers).await;
    peer.write_all(b"<stream><m></n>").await.unwrap();
    next_event(&mut events, |e| *e == StreamEvent::Disconnected { reconnect: true }).await;

    let mut second = within(peers.recv()).await.unwrap();
    within(read_until(&mut second, "<stream>")).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(stream.is_running());

    shutdown(&stream, &mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_write_reconnects() {
    let (mut connector, attempts, mut peers) = loopback(0);
    let fault = Arc::new(WriteFault::default());
    connector.fault = Some(fault.clone());
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    let mut events = stream.subscribe();

    let _peer = open(&stream, &mut peers).await;
    fault.arm();
    stream.send_raw("<presence/>");
    next_event(&mut events, |e| *e == StreamEvent::Disconnected { reconnect: true }).await;

    let mut second = within(peers.recv()).await.unwrap();
    within(read_until(&mut second, "<stream>")).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(stream.state().get(Condition::Connected));

    shutdown(&stream, &mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_write_leaves_replaced_socket_alone() {
    let (mut connector, attempts, mut peers) = loopback(0);
    let fault = Arc::new(WriteFault::default());
    connector.fault = Some(fault.clone());
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    let mut events = stream.subscribe();

    let mut peer = open(&stream, &mut peers).await;
    // The sender hangs in this write, holding the socket, while the peer
    // closes and the read loop starts tearing down.
    let release = fault.arm_held();
    stream.send_raw("<presence/>");
    peer.write_all(b"<stream></stream>").await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    release.send(()).unwrap();

    let mut disconnects = 0;
    within(async {
        loop {
            match events.recv().await.unwrap() {
                StreamEvent::Disconnected { reconnect } => {
                    assert!(reconnect);
                    disconnects += 1;
                }
                StreamEvent::Connected => break,
                _ => (),
            }
        }
    })
    .await;
    let mut second = within(peers.recv()).await.unwrap();
    within(read_until(&mut second, "<stream>")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = events.try_recv() {
        if event.is_disconnected() {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(stream.state().get(Condition::Connected));
    second.write_all(b"<stream>").await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(200), second.read(&mut [0u8; 64]))
        .await
        .is_err());

    shutdown(&stream, &mut events).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_during_reconnect_installs_no_socket() {
    let (mut connector, attempts, mut peers) = loopback(0);
    connector.slow = Some(Duration::from_millis(500));
    let stream = XmppStream::builder(Config::default().tight())
        .connector(connector)
        .build();
    let mut events = stream.subscribe();

    let mut peer = open(&stream, &mut peers).await;
    peer.write_all(b"<stream></stream>").await.unwrap();
    next_event(&mut events, |e| *e == StreamEvent::Disconnected { reconnect: true }).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    shutdown(&stream, &mut events).await;
    assert!(!stream.state().get(Condition::Connected));
    assert_eq!(stream.phase(), Phase::Disconnected);
    let mut second = within(peers.recv()).await.unwrap();
    assert_eq!(within(second.read(&mut [0u8; 64])).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_handshake_failure_reconnects() {
    #[allow(unused_mut)]
    let mut config = Config::default().tight();
    #[cfg(feature = "tls-rust")]
    {
        use tokio_rustls::rustls::{ClientConfig, RootCertStore};
        config.tls = Some(Arc::new(
            ClientConfig::builder()
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth(),
        ));
    }
    let (connector, attempts, mut peers) = loopback(0);
    let stream = XmppStream::builder(config).connector(connector).build();
    stream.register_plugin(Arc::new(StartTls)).unwrap();
    let mut events = stream.subscribe();

    assert!(stream.connect(("loopback", 5222), false, true).await);
    stream.process(false).await;
    let mut peer = within(peers.recv()).await.unwrap();
    within(read_until(&mut peer, "<stream>")).await;
    peer.write_all(
        b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams'>\
          <stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>",
    )
    .await
    .unwrap();
    within(read_until(&mut peer, "<starttls")).await;
    peer.write_all(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
        .await
        .unwrap();
    // Whatever the client hello looks like, the server never answers it.
    let _ = within(peer.read(&mut [0u8; 512])).await;
    drop(peer);

    next_event(&mut events, |e| *e == StreamEvent::Disconnected { reconnect: true }).await;
    let mut second = within(peers.recv()).await.unwrap();
    within(read_until(&mut second, "<stream>")).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(!stream.state().get(Condition::Tls));

    shutdown(&stream, &mut events).await;
}
