//! Edge-triggered reader / writer / all idle timers for one connection.

use std::time::Duration;

use tidewire_core::{EndpointDescriptor, IdleKind};
use tokio::time::Instant;

const KINDS: [IdleKind; 3] = [IdleKind::ReaderIdle, IdleKind::WriterIdle, IdleKind::AllIdle];

fn slot(kind: IdleKind) -> usize {
    match kind {
        IdleKind::ReaderIdle => 0,
        IdleKind::WriterIdle => 1,
        IdleKind::AllIdle => 2,
    }
}

/// Idle thresholds, copied from the descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IdleThresholds {
    pub(crate) reader: Option<Duration>,
    pub(crate) writer: Option<Duration>,
    pub(crate) all: Option<Duration>,
}

impl IdleThresholds {
    pub(crate) fn from_descriptor(descriptor: &EndpointDescriptor) -> Self {
        Self {
            reader: descriptor.reader_idle(),
            writer: descriptor.writer_idle(),
            all: descriptor.all_idle(),
        }
    }

    fn get(&self, kind: IdleKind) -> Option<Duration> {
        match kind {
            IdleKind::ReaderIdle => self.reader,
            IdleKind::WriterIdle => self.writer,
            IdleKind::AllIdle => self.all,
        }
    }
}

/// Tracks read/write activity and reports the next idle deadline.
///
/// Each kind fires once per quiet period: after firing it stays silent
/// until the matching activity re-arms it.
#[derive(Debug)]
pub(crate) struct IdleTimers {
    thresholds: IdleThresholds,
    last_read: Instant,
    last_write: Instant,
    fired: [bool; 3],
}

impl IdleTimers {
    pub(crate) fn new(thresholds: IdleThresholds, now: Instant) -> Self {
        Self {
            thresholds,
            last_read: now,
            last_write: now,
            fired: [false; 3],
        }
    }

    pub(crate) fn on_read(&mut self, now: Instant) {
        self.last_read = now;
        self.fired[slot(IdleKind::ReaderIdle)] = false;
        self.fired[slot(IdleKind::AllIdle)] = false;
    }

    pub(crate) fn on_write(&mut self, now: Instant) {
        self.last_write = now;
        self.fired[slot(IdleKind::WriterIdle)] = false;
        self.fired[slot(IdleKind::AllIdle)] = false;
    }

    pub(crate) fn mark_fired(&mut self, kind: IdleKind) {
        self.fired[slot(kind)] = true;
    }

    /// Earliest armed deadline, if any kind is enabled and armed.
    pub(crate) fn next_deadline(&self) -> Option<(IdleKind, Instant)> {
        KINDS
            .into_iter()
            .filter(|kind| !self.fired[slot(*kind)])
            .filter_map(|kind| {
                let threshold = self.thresholds.get(kind)?;
                let since = match kind {
                    IdleKind::ReaderIdle => self.last_read,
                    IdleKind::WriterIdle => self.last_write,
                    IdleKind::AllIdle => self.last_read.max(self.last_write),
                };
                Some((kind, since + threshold))
            })
            .min_by_key(|(_, at)| *at)
    }
}
