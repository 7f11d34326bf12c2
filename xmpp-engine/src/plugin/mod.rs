// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Plugins
//!
//! A plugin is a bundle of handlers and scheduled tasks installed on a
//! stream through [`XmppStream::register_plugin`]. It only ever uses the
//! public surface of the stream: registering handlers, scheduling and
//! sending.

use crate::{Error, XmppStream};

mod ping;
mod starttls;

pub use self::ping::Ping;
pub use self::starttls::StartTls;

/// An extension installed on a stream.
pub trait Plugin: Send + Sync {
    /// Unique name of the plugin.
    fn name(&self) -> &str;

    /// Human readable summary.
    fn description(&self) -> &str {
        ""
    }

    /// Called once, from [`XmppStream::register_plugin`].
    fn init(&self, stream: &XmppStream) -> Result<(), Error>;

    /// Called once when the stream starts processing, after every plugin
    /// was initialised.
    fn post_init(&self, stream: &XmppStream) {
        let _ = stream;
    }
}
