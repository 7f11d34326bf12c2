// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use xmpp_parsers::ns;

use super::Plugin;
use crate::handler::matcher::{NameMatcher, XPathMatcher};
use crate::handler::{Callback, Directive};
use crate::state::Condition;
use crate::{Error, XmppStream};

/// Negotiates STARTTLS (RFC 6120, section 5) when the stream was connected
/// with `use_tls` and the server offers it.
///
/// All three handlers run on the read loop: `<proceed/>` must be acted upon
/// before the parser reads a single byte of the TLS handshake.
#[derive(Debug, Default)]
pub struct StartTls;

impl StartTls {
    fn request() -> String {
        format!("<starttls xmlns='{}'/>", ns::TLS)
    }
}

impl Plugin for StartTls {
    fn name(&self) -> &str {
        "starttls"
    }

    fn description(&self) -> &str {
        "STARTTLS negotiation"
    }

    fn init(&self, stream: &XmppStream) -> Result<(), Error> {
        let offer = XPathMatcher::new(&format!("{{{}}}features/{{{}}}starttls", ns::STREAM, ns::TLS))?;
        stream.register_handler(Arc::new(Callback::in_stream(
            "STARTTLS offer",
            offer,
            |stream, _| {
                let state = stream.state();
                if stream.use_tls() && !state.get(Condition::Tls) && !state.get(Condition::Ssl) {
                    log::debug!("Requesting STARTTLS");
                    stream.send_raw(StartTls::request());
                }
                Directive::Continue
            },
        )));
        stream.register_handler(Arc::new(Callback::in_stream(
            "STARTTLS proceed",
            NameMatcher::with_ns("proceed", ns::TLS),
            |_, _| Directive::StartTls,
        )));
        stream.register_handler(Arc::new(Callback::in_stream(
            "STARTTLS failure",
            NameMatcher::with_ns("failure", ns::TLS),
            |_, _| {
                log::error!("Server refused STARTTLS");
                Directive::Close
            },
        )));
        Ok(())
    }
}
