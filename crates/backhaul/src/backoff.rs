use std::time::{Duration, Instant};

/// Retry schedule for the client's dial loop.
///
/// `next_backoff` returns how long to sleep before the next attempt, or
/// `None` to give up. `reset` signals a successful connection so the next
/// failure starts the schedule over.
pub trait Backoff: Send {
    fn next_backoff(&mut self) -> Option<Duration>;
    fn reset(&mut self);
}

/// Exponential backoff with a growth factor, an interval ceiling and a total
/// time budget.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    max_elapsed: Option<Duration>,
    current: Duration,
    started: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
        max_elapsed: Option<Duration>,
    ) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval,
            multiplier,
            max_interval,
            max_elapsed,
            current: initial_interval,
            started: None,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(
            Duration::from_millis(500),
            1.5,
            Duration::from_secs(60),
            Some(Duration::from_secs(15 * 60)),
        )
    }
}

impl Backoff for ExponentialBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let started = *self.started.get_or_insert(now);
        if let Some(max_elapsed) = self.max_elapsed {
            if now.duration_since(started) > max_elapsed {
                return None;
            }
        }
        let interval = self.current;
        self.current = self
            .current
            .mul_f64(self.multiplier)
            .min(self.max_interval);
        Some(interval)
    }

    fn reset(&mut self) {
        self.current = self.initial_interval;
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_up_to_ceiling() {
        let mut b = ExponentialBackoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(350),
            None,
        );
        assert_eq!(b.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(b.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(b.next_backoff(), Some(Duration::from_millis(350)));
        assert_eq!(b.next_backoff(), Some(Duration::from_millis(350)));
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut b = ExponentialBackoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
            None,
        );
        b.next_backoff();
        b.next_backoff();
        b.reset();
        assert_eq!(b.next_backoff(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn gives_up_after_time_budget() {
        let mut b = ExponentialBackoff::new(
            Duration::from_millis(1),
            1.0,
            Duration::from_millis(1),
            Some(Duration::ZERO),
        );
        // First call starts the clock and is still within budget.
        assert!(b.next_backoff().is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(b.next_backoff(), None);
    }
}
