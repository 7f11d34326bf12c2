// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::time::Duration;
use std::sync::Arc;

use tokio::time::Instant;
use xmpp_parsers::ns;

use super::Plugin;
use crate::handler::matcher::MaskMatcher;
use crate::handler::Callback;
use crate::minidom::Element;
use crate::{Error, XmppStream};

/// XEP-0199: XMPP Ping.
///
/// Answers pings and, with [`Ping::keepalive`], pings a peer periodically.
/// A keepalive ping without answer makes the stream disconnect and
/// reconnect.
#[derive(Debug, Clone)]
pub struct Ping {
    keepalive: Option<(Duration, String)>,
    timeout: Duration,
}

impl Default for Ping {
    fn default() -> Self {
        Self {
            keepalive: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl Ping {
    /// Only answer pings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also ping `target` every `every`.
    pub fn keepalive<S: Into<String>>(mut self, every: Duration, target: S) -> Self {
        self.keepalive = Some((every, target.into()));
        self
    }

    /// How long to wait for an answer to a keepalive ping.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ping `to` and return the round trip time.
    ///
    /// An error response counts as an answer: the peer is alive.
    pub async fn send_ping(
        stream: &XmppStream,
        to: &str,
        timeout: Option<Duration>,
    ) -> Result<Duration, Error> {
        let iq = Element::builder("iq", stream.config().default_ns.clone())
            .attr("type", "get".to_owned())
            .attr("to", to.to_owned())
            .append(Element::builder("ping", ns::PING).build())
            .build();
        let start = Instant::now();
        let reply = stream.send_iq(iq, timeout).await?;
        if reply.type_() == Some("error") {
            log::debug!("ping to {} answered with an error", to);
        }
        Ok(start.elapsed())
    }

    fn mask(default_ns: &str) -> String {
        if default_ns.is_empty() {
            format!("<iq type='get'><ping xmlns='{}'/></iq>", ns::PING)
        } else {
            format!(
                "<iq type='get' xmlns='{}'><ping xmlns='{}'/></iq>",
                default_ns,
                ns::PING
            )
        }
    }
}

impl Plugin for Ping {
    fn name(&self) -> &str {
        "xep_0199"
    }

    fn description(&self) -> &str {
        "XMPP Ping"
    }

    fn init(&self, stream: &XmppStream) -> Result<(), Error> {
        let mask = MaskMatcher::new(&Self::mask(&stream.config().default_ns))?;
        stream.register_handler(Arc::new(Callback::new(
            "XMPP Ping",
            mask,
            |stream, stanza| {
                stream.send_element(&stanza.make_reply())?;
                Ok(())
            },
        )));
        Ok(())
    }

    fn post_init(&self, stream: &XmppStream) {
        let Some((every, ref target)) = self.keepalive else {
            return;
        };
        let target = target.clone();
        let timeout = self.timeout;
        stream.schedule(
            "Ping keepalive",
            every,
            move |stream| {
                let stream = stream.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    if let Err(e) = Ping::send_ping(&stream, &target, Some(timeout)).await {
                        log::debug!("Did not receive ping back in time ({}). Requesting reconnect.", e);
                        stream.disconnect(true).await;
                    }
                });
                Ok(())
            },
            true,
        );
    }
}
