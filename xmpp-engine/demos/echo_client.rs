// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Echo messages
//!
//! Connects to a server, negotiates STARTTLS when offered, keeps the link
//! alive with pings and sends every `<message/>` with a body back to its
//! sender. Authentication is out of scope, so against a real server this
//! only gets as far as the stream features; point it at a test server
//! which accepts unauthenticated stanzas to see the echo.
//!
//! Stop it with Ctrl-C.

use std::env::args;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use xmpp_engine::handler::matcher::NameMatcher;
use xmpp_engine::handler::Callback;
use xmpp_engine::minidom::Element;
use xmpp_engine::parsers::ns;
use xmpp_engine::plugin::{Ping, StartTls};
use xmpp_engine::{Config, StreamEvent, XmppStream};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = args().collect();
    if args.len() < 2 || args.len() > 4 {
        println!("Usage: {} <domain> [host] [port]", args[0]);
        exit(1);
    }
    let domain = args[1].clone();
    let host = args.get(2).cloned().unwrap_or_else(|| domain.clone());
    let port = match args.get(3).map(|p| p.parse::<u16>()) {
        None => 5222,
        Some(Ok(port)) => port,
        Some(Err(e)) => {
            println!("Invalid port: {}", e);
            exit(1);
        }
    };

    let mut config = Config::client(&domain);
    config.handler_threads = 2;
    let stream = XmppStream::new(config);

    stream
        .register_plugin(Arc::new(StartTls))
        .expect("STARTTLS plugin");
    stream
        .register_plugin(Arc::new(
            Ping::new().keepalive(Duration::from_secs(60), domain.clone()),
        ))
        .expect("ping plugin");
    stream.register_handler(Arc::new(Callback::new(
        "echo",
        NameMatcher::with_ns("message", ns::JABBER_CLIENT),
        |stream, stanza| {
            let (Some(from), Some(body)) = (stanza.from(), stanza.element().get_child("body", ns::JABBER_CLIENT)) else {
                return Ok(());
            };
            if stanza.type_() == Some("error") {
                return Ok(());
            }
            println!("{} says: {}", from, body.text());
            let reply = Element::builder("message", ns::JABBER_CLIENT)
                .attr("to", from.to_owned())
                .attr("type", stanza.type_().unwrap_or("chat").to_owned())
                .append(
                    Element::builder("body", ns::JABBER_CLIENT)
                        .append(body.text())
                        .build(),
                )
                .build();
            stream.send_element(&reply)?;
            Ok(())
        },
    )));

    let mut events = stream.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {:?}", event);
            if event == StreamEvent::Quit {
                break;
            }
        }
    });

    if !stream.connect((host, port), false, true).await {
        println!("Could not connect");
        exit(1);
    }
    stream.process(false).await;

    tokio::signal::ctrl_c().await.expect("Ctrl-C handler");
    stream.disconnect(false).await;
    stream.join().await;
}
