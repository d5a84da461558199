//! A sliding 20-second window over (timestamp, bytes) samples, reporting
//! the current transfer rate.
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(20);

pub struct SpeedTracker {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self { samples: VecDeque::new() }
    }

    pub fn record(&mut self, bytes: u64) {
        self.prune();
        self.samples.push_back((Instant::now(), bytes));
    }

    /// Bytes/second averaged over the trailing window.
    pub fn current_speed(&mut self) -> f64 {
        self.prune();
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        total as f64 / WINDOW.as_secs_f64()
    }

    fn prune(&mut self) {
        let cutoff = Instant::now().checked_sub(WINDOW);
        if let Some(cutoff) = cutoff {
            while let Some(&(ts, _)) = self.samples.front() {
                if ts < cutoff {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn speed_reflects_recorded_samples_within_the_window() {
        let mut tracker = SpeedTracker::new();
        tracker.record(1000);
        tracker.record(1000);
        let speed = tracker.current_speed();
        assert!((speed - 2000.0 / 20.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn samples_older_than_the_window_are_pruned() {
        let mut tracker = SpeedTracker::new();
        tracker.record(1000);
        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(tracker.current_speed(), 0.0);
    }

    #[tokio::test]
    async fn empty_tracker_reports_zero_speed() {
        let mut tracker = SpeedTracker::new();
        assert_eq!(tracker.current_speed(), 0.0);
    }
}
