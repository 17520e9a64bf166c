//! Cooperative timer queue, drained by [`Vm::pump_events`](super::Vm::pump_events)

use crate::value::Value;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Timer {
    id: u64,
    due: f64,
    pub(crate) callback: Value,
}

/// Timers scheduled by guest code or the embedder
#[derive(Debug, Default)]
pub struct EventQueue {
    now: f64,
    next_id: u64,
    timers: Vec<Timer>,
}

impl EventQueue {
    /// Queue a callback `delay_ms` after the current event time
    pub fn schedule(&mut self, callback: Value, delay_ms: f64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.timers.push(Timer {
            id,
            due: self.now + delay_ms.max(0.0),
            callback,
        });
        id
    }

    /// Number of queued timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timers are queued
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Current event time in milliseconds
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Advance time and take every timer that became due, ordered by due
    /// time then scheduling order
    pub(crate) fn advance(&mut self, dt_ms: f64) -> Vec<Timer> {
        self.now += dt_ms.max(0.0);
        let now = self.now;
        let (mut due, waiting): (Vec<Timer>, Vec<Timer>) =
            self.timers.drain(..).partition(|t| t.due <= now);
        self.timers = waiting;
        due.sort_by(|a, b| a.due.total_cmp(&b.due).then(a.id.cmp(&b.id)));
        due
    }

    /// Put back timers that were taken but not run
    pub(crate) fn requeue(&mut self, timers: impl IntoIterator<Item = Timer>) {
        self.timers.extend(timers);
    }

    pub(crate) fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.timers.iter().map(|t| t.callback)
    }
}
