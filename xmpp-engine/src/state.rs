// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Connection state conditions
//!
//! The [`StateMachine`] is the one structure every task of an
//! [`XmppStream`][`crate::XmppStream`] touches without holding another lock:
//! the read loop, the sender, the handler workers and the caller all
//! coordinate lifecycle transitions through it.
//!
//! The set of conditions is fixed at compile time ([`Condition`]). Each
//! update is atomic and immediately visible to every other task, and
//! [`StateMachine::wait_for`] lets a task block until a condition reaches a
//! value (e.g. "wait until connected").

use core::fmt;
use core::str::FromStr;
use core::time::Duration;

use tokio::sync::watch;

use crate::Error;

/// A named lifecycle condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    /// A socket is established.
    Connected,
    /// The read loop is running.
    Processing,
    /// A dropped connection is re-established automatically.
    Reconnect,
    /// A final disconnect is in progress.
    Disconnecting,
    /// The socket was upgraded with STARTTLS.
    Tls,
    /// The socket was wrapped in TLS before the stream opened.
    Ssl,
    /// This side initiated the connection and sends the stream header first.
    IsClient,
}

impl Condition {
    /// All conditions, in storage order.
    pub const ALL: [Condition; 7] = [
        Condition::Connected,
        Condition::Processing,
        Condition::Reconnect,
        Condition::Disconnecting,
        Condition::Tls,
        Condition::Ssl,
        Condition::IsClient,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// The value a fresh connection starts with.
    pub fn initial(self) -> bool {
        match self {
            Condition::Reconnect => true,
            _ => false,
        }
    }

    /// The wire-independent name of the condition.
    pub fn name(self) -> &'static str {
        match self {
            Condition::Connected => "connected",
            Condition::Processing => "processing",
            Condition::Reconnect => "reconnect",
            Condition::Disconnecting => "disconnecting",
            Condition::Tls => "tls",
            Condition::Ssl => "ssl",
            Condition::IsClient => "is-client",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Condition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::ALL
            .iter()
            .copied()
            .find(|cond| cond.name() == s)
            .ok_or_else(|| Error::UnknownCondition(s.to_owned()))
    }
}

type Values = [bool; Condition::ALL.len()];

/// Thread-safe store of the [`Condition`] values of one connection.
#[derive(Debug)]
pub struct StateMachine {
    values: watch::Sender<Values>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a state machine seeded with every condition's initial value.
    pub fn new() -> Self {
        let mut values = [false; Condition::ALL.len()];
        for cond in Condition::ALL {
            values[cond.index()] = cond.initial();
        }
        let (values, _) = watch::channel(values);
        Self { values }
    }

    /// Read the current value of `cond`.
    pub fn get(&self, cond: Condition) -> bool {
        self.values.borrow()[cond.index()]
    }

    /// Atomically store `value` for `cond`.
    pub fn set(&self, cond: Condition, value: bool) {
        self.swap(cond, value);
    }

    /// Atomically store `value` for `cond`, returning the previous value.
    pub fn swap(&self, cond: Condition, value: bool) -> bool {
        let mut previous = value;
        self.values.send_if_modified(|values| {
            previous = values[cond.index()];
            values[cond.index()] = value;
            previous != value
        });
        if previous != value {
            log::trace!("state {} -> {}", cond, value);
        }
        previous
    }

    /// Look up a condition by name and read it.
    ///
    /// Fails with [`Error::UnknownCondition`] for names which do not belong
    /// to the fixed set.
    pub fn get_named(&self, name: &str) -> Result<bool, Error> {
        Ok(self.get(name.parse()?))
    }

    /// Look up a condition by name and store `value`.
    pub fn set_named(&self, name: &str, value: bool) -> Result<(), Error> {
        self.set(name.parse()?, value);
        Ok(())
    }

    /// Wait until `cond` has `value`, or until `timeout` expires.
    ///
    /// Returns whether the condition reached the value in time. Returns
    /// immediately if it already holds.
    pub async fn wait_for(&self, cond: Condition, value: bool, timeout: Duration) -> bool {
        let mut rx = self.values.subscribe();
        let wait = rx.wait_for(|values| values[cond.index()] == value);
        let reached = matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)));
        reached
    }
}
