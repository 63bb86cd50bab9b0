//! Escape detection.
//!
//! Copying a tracked file to an untracked directory is a read of the source
//! followed by a create of the destination, both by the same session. Each
//! open of a tracked file records a departure; a create of an untracked file
//! with the same name by the same session inside the window picks it up and
//! the new file inherits the originating header.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use veil_core::{HeaderId, NormalizedPath, SessionId};

/// Departures kept at most; older ones are dropped first.
const MAX_DEPARTURES: usize = 256;

#[derive(Debug, Clone)]
pub struct Departure {
    pub session: SessionId,
    pub name: String,
    pub from: NormalizedPath,
    pub header: HeaderId,
    pub at: Instant,
}

pub struct EscapeTracker {
    window: Duration,
    departures: Mutex<VecDeque<Departure>>,
}

impl EscapeTracker {
    pub fn new(window: Duration) -> Self {
        EscapeTracker {
            window,
            departures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Remember that `session` opened the tracked file at `from`.
    pub fn record(&self, session: SessionId, from: &NormalizedPath, header: HeaderId) {
        if self.window.is_zero() {
            return;
        }
        let Some(name) = from.file.clone() else {
            return;
        };
        let mut departures = self.departures.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut departures);
        departures.retain(|d| !(d.session == session && d.from.same_as(from)));
        if departures.len() == MAX_DEPARTURES {
            departures.pop_front();
        }
        departures.push_back(Departure {
            session,
            name,
            from: from.clone(),
            header,
            at: Instant::now(),
        });
    }

    /// Claim the newest departure matching a create of `target` by `session`.
    pub fn claim(&self, session: SessionId, target: &NormalizedPath) -> Option<Departure> {
        let name = target.file.as_deref()?;
        let mut departures = self.departures.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut departures);
        let pos = departures.iter().rposition(|d| {
            d.session == session && d.name.eq_ignore_ascii_case(name) && !d.from.same_as(target)
        })?;
        departures.remove(pos)
    }

    /// Forget everything recorded for `session`.
    pub fn forget_session(&self, session: SessionId) {
        self.departures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|d| d.session != session);
    }

    pub fn clear(&self) {
        self.departures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.departures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, departures: &mut VecDeque<Departure>) {
        while departures
            .front()
            .is_some_and(|d| d.at.elapsed() >= self.window)
        {
            departures.pop_front();
        }
    }
}
