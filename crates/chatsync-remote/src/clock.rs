use std::sync::Mutex;

use chatsync_shared::ServerTime;

#[derive(Debug)]
enum Mode {
    /// Local wall clock shifted by a fixed skew.
    System { skew_ms: i64 },
    /// Only moves when told to; used by tests.
    Manual { now_ms: i64 },
}

#[derive(Debug)]
struct ClockState {
    mode: Mode,
    last_stamp: i64,
}

/// The simulated store's clock.
///
/// Stamps handed out for writes are strictly increasing so two writes never
/// share a server timestamp.
#[derive(Debug)]
pub struct ServerClock {
    state: Mutex<ClockState>,
}

impl ServerClock {
    pub fn system(skew_ms: i64) -> Self {
        Self::with_mode(Mode::System { skew_ms })
    }

    pub fn manual(start_ms: i64) -> Self {
        Self::with_mode(Mode::Manual { now_ms: start_ms })
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            state: Mutex::new(ClockState {
                mode,
                last_stamp: i64::MIN,
            }),
        }
    }

    pub fn now(&self) -> ServerTime {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        ServerTime(read(&state.mode))
    }

    /// A write stamp: `now`, bumped past the previous stamp if needed.
    pub fn stamp(&self) -> ServerTime {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = read(&state.mode).max(state.last_stamp.saturating_add(1));
        state.last_stamp = now;
        ServerTime(now)
    }

    /// Move the clock forward. On a system clock this grows the skew.
    pub fn advance(&self, ms: i64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut state.mode {
            Mode::System { skew_ms } => *skew_ms += ms,
            Mode::Manual { now_ms } => *now_ms += ms,
        }
    }
}

fn read(mode: &Mode) -> i64 {
    match mode {
        Mode::System { skew_ms } => ServerTime::local_now().millis() + skew_ms,
        Mode::Manual { now_ms } => *now_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_strictly_increasing() {
        let clock = ServerClock::manual(100);
        let a = clock.stamp();
        let b = clock.stamp();
        assert_eq!(a, ServerTime(100));
        assert_eq!(b, ServerTime(101));
        clock.advance(50);
        assert_eq!(clock.now(), ServerTime(150));
        assert_eq!(clock.stamp(), ServerTime(150));
    }
}
