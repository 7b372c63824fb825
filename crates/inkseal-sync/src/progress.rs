//! Progress reporting for long-running pipeline work.
//!
//! The pipeline pushes raw [`ProgressUpdate`]s into an unbounded channel;
//! consumers decide how often to surface them via [`ProgressThrottle`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Coarse phase of an encrypt-and-upload run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reading,
    Compressing,
    Encrypting,
    WrappingKeys,
    Uploading,
    SavingMetadata,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub stage: Stage,
    /// 0..=100
    pub percent: u8,
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressUpdate>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Best-effort send; a dropped receiver just means nobody is watching.
pub(crate) fn report(progress: Option<&ProgressSender>, stage: Stage, percent: u8) {
    if let Some(tx) = progress {
        let _ = tx.send(ProgressUpdate {
            stage,
            percent: percent.min(100),
        });
    }
}

/// Percent for `done` of `total` steps mapped into `[from, to]`.
pub(crate) fn scaled(from: u8, to: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return to;
    }
    let span = u64::from(to.saturating_sub(from));
    let step = span * done.min(total) as u64 / total as u64;
    from + step as u8
}

/// Rate limiter for progress events. Completion (100%) always passes.
#[derive(Debug)]
pub struct ProgressThrottle {
    min_interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
            last_percent: None,
        }
    }

    pub fn should_emit(&mut self, percent: u8) -> bool {
        if self.last_percent == Some(percent) {
            return false;
        }
        let now = Instant::now();
        let due = match self.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        };
        if due || percent >= 100 {
            self.last_emit = Some(now);
            self.last_percent = Some(percent);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled() {
        assert_eq!(scaled(10, 80, 0, 4), 10);
        assert_eq!(scaled(10, 80, 2, 4), 45);
        assert_eq!(scaled(10, 80, 4, 4), 80);
        assert_eq!(scaled(10, 80, 9, 4), 80);
        assert_eq!(scaled(10, 80, 0, 0), 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_interval() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(250));
        assert!(throttle.should_emit(10));
        assert!(!throttle.should_emit(20));

        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(throttle.should_emit(30));
        assert!(!throttle.should_emit(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_always_passes() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_emit(50));
        assert!(throttle.should_emit(100));
        assert!(!throttle.should_emit(100), "duplicates are suppressed");
    }

    #[test]
    fn test_report_without_receiver_is_harmless() {
        let (tx, rx) = progress_channel();
        drop(rx);
        report(Some(&tx), Stage::Encrypting, 150);
        report(None, Stage::Done, 100);
    }
}
