// Copyright (c) 2026 xmpp-engine contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Named timed tasks
//!
//! The scheduler never runs callbacks itself. When a task is due, a
//! scheduled-call event is pushed onto the event queue shared with stanza
//! dispatch and one of the handler workers picks it up. Repeating tasks are
//! rescheduled relative to the time they were due, not to the time the
//! event was handled, so callback latency does not accumulate.

use core::time::Duration;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use crate::event::{Event, ScheduledCall, TaskFn};

// A zero period would make a repeating task fire in a busy loop.
const MIN_PERIOD: Duration = Duration::from_millis(1);

pub(crate) struct Task {
    name: String,
    deadline: Instant,
    period: Option<Duration>,
    callback: Arc<TaskFn>,
}

pub(crate) enum Command {
    Add(Task),
    Remove(String),
}

/// Handle used to add and cancel tasks.
///
/// Commands are buffered until the scheduler task is started, so tasks may be
/// scheduled before the stream is processing.
#[derive(Clone)]
pub(crate) struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }

    /// Register `callback` to be due after `delay`, and every `delay` after
    /// that if `repeat` is set. A task with the same name is replaced.
    pub(crate) fn add(&self, name: &str, delay: Duration, callback: Arc<TaskFn>, repeat: bool) {
        let task = Task {
            name: name.to_owned(),
            // The deadline counts from the call, not from when the
            // scheduler gets to see the command.
            deadline: Instant::now() + delay,
            period: repeat.then(|| delay.max(MIN_PERIOD)),
            callback,
        };
        if self.commands.send(Command::Add(task)).is_err() {
            log::warn!("scheduler is gone, dropping task {}", name);
        }
    }

    /// Cancel the task called `name`. Already queued firings still run.
    pub(crate) fn remove(&self, name: &str) {
        let _ = self.commands.send(Command::Remove(name.to_owned()));
    }
}

/// Body of the scheduler task; returns once `running` turns false, the
/// event queue is closed or every [`Scheduler`] handle is gone.
pub(crate) async fn run(
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    mut running: watch::Receiver<bool>,
) {
    let mut tasks: Vec<Task> = Vec::new();
    loop {
        let next = tasks.iter().map(|t| t.deadline).min();
        tokio::select! {
            biased;
            _ = running.wait_for(|running| !*running) => break,
            command = commands.recv() => match command {
                Some(Command::Add(task)) => {
                    log::debug!("scheduling task {}", task.name);
                    tasks.retain(|t| t.name != task.name);
                    tasks.push(task);
                }
                Some(Command::Remove(name)) => {
                    log::debug!("removing task {}", name);
                    tasks.retain(|t| t.name != name);
                }
                None => break,
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                if !fire_due(&mut tasks, &events) {
                    break;
                }
            }
        }
    }
    log::debug!("scheduler stopped");
}

/// Queue every due task; returns false once the queue is closed.
fn fire_due(tasks: &mut Vec<Task>, events: &mpsc::UnboundedSender<Event>) -> bool {
    let now = Instant::now();
    let mut open = true;
    tasks.retain_mut(|task| {
        if !open || task.deadline > now {
            return true;
        }
        log::trace!("task {} is due", task.name);
        let call = ScheduledCall {
            name: task.name.clone(),
            callback: task.callback.clone(),
            nominal: task.deadline,
            queued: Instant::now(),
        };
        if events.send(Event::Schedule(call)).is_err() {
            open = false;
            return true;
        }
        match task.period {
            Some(period) => {
                task.deadline += period;
                true
            }
            None => false,
        }
    });
    open
}
