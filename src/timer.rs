//! Cancellable timer bookkeeping for the link state machine.
//!
//! The machine never sleeps. It asks the runtime to fire a timer and hands
//! out a token; a firing whose token is no longer current is stale and is
//! ignored, even if the runtime already queued it.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Gives up on the current scan attempt.
    Scan,
    /// Widens a filtered scan into an unfiltered one.
    BroadScan,
    /// Pause between scan attempts.
    ScanBackoff,
    /// Gives up on a connection attempt.
    Connect,
    /// Drops a half-received frame.
    Reassembly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// What the runtime has to do about a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    Arm { kind: TimerKind, token: TimerToken, after: Duration },
    Cancel { kind: TimerKind },
}

#[derive(Debug, Default)]
pub struct Timers {
    next: u64,
    armed: HashMap<TimerKind, TimerToken>,
}

impl Timers {
    /// Arms `kind`, superseding any pending firing of the same kind.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) -> TimerRequest {
        self.next += 1;
        let token = TimerToken(self.next);
        self.armed.insert(kind, token);
        TimerRequest::Arm { kind, token, after }
    }

    /// Returns a request only if something was actually pending.
    pub fn cancel(&mut self, kind: TimerKind) -> Option<TimerRequest> {
        self.armed.remove(&kind).map(|_| TimerRequest::Cancel { kind })
    }

    pub fn cancel_all(&mut self) -> Vec<TimerRequest> {
        self.armed
            .drain()
            .map(|(kind, _)| TimerRequest::Cancel { kind })
            .collect()
    }

    /// Consumes a firing. False means it was cancelled or superseded.
    pub fn fire(&mut self, kind: TimerKind, token: TimerToken) -> bool {
        match self.armed.get(&kind) {
            Some(current) if *current == token => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(request: TimerRequest) -> TimerToken {
        match request {
            TimerRequest::Arm { token, .. } => token,
            TimerRequest::Cancel { .. } => panic!("expected arm"),
        }
    }

    #[test]
    fn rearm_makes_old_token_stale() {
        let mut timers = Timers::default();
        let first = token(timers.arm(TimerKind::Scan, Duration::from_secs(60)));
        let second = token(timers.arm(TimerKind::Scan, Duration::from_secs(60)));
        assert!(!timers.fire(TimerKind::Scan, first));
        assert!(timers.fire(TimerKind::Scan, second));
        // fires once
        assert!(!timers.fire(TimerKind::Scan, second));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timers = Timers::default();
        let t = token(timers.arm(TimerKind::Connect, Duration::from_secs(30)));
        assert_eq!(
            timers.cancel(TimerKind::Connect),
            Some(TimerRequest::Cancel { kind: TimerKind::Connect })
        );
        assert_eq!(timers.cancel(TimerKind::Connect), None);
        assert!(!timers.fire(TimerKind::Connect, t));
    }

    #[test]
    fn kinds_are_independent() {
        let mut timers = Timers::default();
        let scan = token(timers.arm(TimerKind::Scan, Duration::from_secs(60)));
        let connect = token(timers.arm(TimerKind::Connect, Duration::from_secs(30)));
        assert!(!timers.fire(TimerKind::Scan, connect));
        assert!(timers.fire(TimerKind::Connect, connect));
        assert!(timers.is_armed(TimerKind::Scan));
        assert_eq!(timers.cancel_all().len(), 1);
        assert!(!timers.fire(TimerKind::Scan, scan));
    }
}
