// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One-shot connection timers with stale-fire protection.
//!
//! Each arm hands out a fresh [`TimerToken`]; a firing is honored only
//! when its token still matches the armed entry, so a timer canceled and
//! re-armed between scheduling and firing is a no-op.

use std::time::Instant;

/// The independent one-shot timers a connection owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Armed before validation; fires if the handshake stalls.
    Connect,
    /// Armed when graceful shutdown starts; fires if it never drains.
    Close,
    /// Armed when the connection goes quiescent; fires a graceful close.
    Inactivity,
    /// Peer-liveness check: fires if no bytes arrive for the idle window.
    Idle,
    /// Periodic trigger for the heartbeat / quiescence check.
    Heartbeat,
}

const KIND_COUNT: usize = 5;

fn index(kind: TimerKind) -> usize {
    match kind {
        TimerKind::Connect => 0,
        TimerKind::Close => 1,
        TimerKind::Inactivity => 2,
        TimerKind::Idle => 3,
        TimerKind::Heartbeat => 4,
    }
}

/// Identity of one arm of one timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TimerToken(u64);

/// Per-connection timer table, guarded by the connection's lock.
#[derive(Debug, Default)]
pub(crate) struct TimerTable {
    next_token: u64,
    entries: [Option<(TimerToken, Instant)>; KIND_COUNT],
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer; any previous arm becomes stale.
    pub fn schedule(&mut self, kind: TimerKind, deadline: Instant) -> TimerToken {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.entries[index(kind)] = Some((token, deadline));
        token
    }

    /// Disarm a timer.
    pub fn cancel(&mut self, kind: TimerKind) {
        self.entries[index(kind)] = None;
    }

    pub fn cancel_all(&mut self) {
        self.entries = Default::default();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.entries[index(kind)].is_some()
    }

    /// Consume a firing; `false` when the token is stale.
    pub fn fired(&mut self, kind: TimerKind, token: TimerToken) -> bool {
        match self.entries[index(kind)] {
            Some((armed, _)) if armed == token => {
                self.entries[index(kind)] = None;
                true
            }
            _ => false,
        }
    }

    /// Timers whose deadlines have passed.
    pub fn due(&self, now: Instant) -> Vec<(TimerKind, TimerToken)> {
        const KINDS: [TimerKind; KIND_COUNT] = [
            TimerKind::Connect,
            TimerKind::Close,
            TimerKind::Inactivity,
            TimerKind::Idle,
            TimerKind::Heartbeat,
        ];
        let mut due = Vec::new();
        for kind in KINDS {
            if let Some((token, deadline)) = self.entries[index(kind)] {
                if deadline <= now {
                    due.push((kind, token));
                }
            }
        }
        due
    }

    /// Earliest armed deadline, for the reactor's poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .flatten()
            .map(|(_, deadline)| *deadline)
            .min()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stale_token_is_ignored() {
        let mut table = TimerTable::new();
        let now = Instant::now();

        let old = table.schedule(TimerKind::Connect, now);
        let new = table.schedule(TimerKind::Connect, now + Duration::from_secs(1));

        // The re-arm invalidated the first token.
        assert!(!table.fired(TimerKind::Connect, old));
        assert!(table.is_armed(TimerKind::Connect));
        assert!(table.fired(TimerKind::Connect, new));
        assert!(!table.is_armed(TimerKind::Connect));
    }

    #[test]
    fn test_cancel_then_fire_is_noop() {
        let mut table = TimerTable::new();
        let token = table.schedule(TimerKind::Inactivity, Instant::now());
        table.cancel(TimerKind::Inactivity);
        assert!(!table.fired(TimerKind::Inactivity, token));
    }

    #[test]
    fn test_due_and_next_deadline() {
        let mut table = TimerTable::new();
        let now = Instant::now();
        let soon = now + Duration::from_millis(50);
        let later = now + Duration::from_secs(5);

        table.schedule(TimerKind::Close, later);
        table.schedule(TimerKind::Idle, soon);

        assert_eq!(table.next_deadline(), Some(soon));
        assert!(table.due(now).is_empty());

        let due = table.due(soon);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, TimerKind::Idle);
    }

    #[test]
    fn test_cancel_all() {
        let mut table = TimerTable::new();
        table.schedule(TimerKind::Connect, Instant::now());
        table.schedule(TimerKind::Heartbeat, Instant::now());
        table.cancel_all();
        assert_eq!(table.next_deadline(), None);
    }
}
