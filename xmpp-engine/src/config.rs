// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use core::time::Duration;
#[cfg(feature = "tls-rust")]
use std::sync::Arc;

#[cfg(feature = "tls-rust")]
use tokio_rustls::rustls::ClientConfig;

use xmpp_parsers::ns;

/// Settings of an [`XmppStream`][`crate::XmppStream`].
///
/// All fields are public; start from [`Config::default`] or
/// [`Config::client`] and adjust what you need.
#[derive(Clone)]
pub struct Config {
    /// Namespace stanzas must be in to get a registered stanza kind.
    pub default_ns: String,

    /// Sent to open the stream when this side initiated the connection.
    pub stream_header: String,

    /// Sent to close the stream.
    pub stream_footer: String,

    /// Number of handler workers draining the event queue.
    ///
    /// With more than one worker, handlers for different stanzas may
    /// complete out of order.
    pub handler_threads: usize,

    /// Fixed delay between connection attempts.
    pub reconnect_delay: Duration,

    /// Default time to wait for the answer to a request.
    pub response_timeout: Duration,

    /// How long a worker blocks on the event queue before it looks at the
    /// run flag again.
    pub event_poll_timeout: Duration,

    /// Time given to the stream footer to reach the peer on disconnect.
    pub disconnect_grace: Duration,

    /// TLS settings; the platform's root certificates are used if unset.
    #[cfg(feature = "tls-rust")]
    pub tls: Option<Arc<ClientConfig>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_ns: String::new(),
            stream_header: String::from("<stream>"),
            stream_footer: String::from("</stream>"),
            handler_threads: 1,
            reconnect_delay: Duration::from_secs(1),
            response_timeout: Duration::from_secs(10),
            event_poll_timeout: Duration::from_secs(5),
            disconnect_grace: Duration::from_secs(1),
            #[cfg(feature = "tls-rust")]
            tls: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = f.debug_struct("Config");
        s.field("default_ns", &self.default_ns)
            .field("stream_header", &self.stream_header)
            .field("stream_footer", &self.stream_footer)
            .field("handler_threads", &self.handler_threads)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("response_timeout", &self.response_timeout)
            .field("event_poll_timeout", &self.event_poll_timeout)
            .field("disconnect_grace", &self.disconnect_grace);
        #[cfg(feature = "tls-rust")]
        s.field("tls", &self.tls.is_some());
        s.finish()
    }
}

impl Config {
    /// Settings for a client-to-server stream to `domain`.
    pub fn client(domain: &str) -> Self {
        Self {
            default_ns: String::from(ns::JABBER_CLIENT),
            stream_header: format!(
                "<stream:stream to='{}' xmlns:stream='{}' xmlns='{}' version='1.0'>",
                escape_attr(domain),
                ns::STREAM,
                ns::JABBER_CLIENT,
            ),
            stream_footer: String::from("</stream:stream>"),
            ..Self::default()
        }
    }

    /// Shorter waits, for tests and local links.
    pub fn tight(mut self) -> Self {
        self.reconnect_delay = Duration::from_millis(100);
        self.response_timeout = Duration::from_secs(2);
        self.event_poll_timeout = Duration::from_millis(500);
        self.disconnect_grace = Duration::from_millis(200);
        self
    }
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
