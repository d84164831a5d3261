use model::FeedState;
use std::collections::VecDeque;

/// Sliding window over the most recently observed feed states, used to
/// detect sudden degradation of a changefeed that had been running cleanly.
///
/// A ring: pushing into a full window drops the oldest sample, so the shift
/// performed once per tick never copies the buffer.
#[derive(Debug)]
pub struct StateWindow {
    samples: VecDeque<FeedState>,
    capacity: usize,
}

impl StateWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, state: FeedState) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(state);
    }

    /// True when every recorded sample is `Normal`. Vacuously true for a
    /// window that has not recorded anything yet: a freshly adopted
    /// changefeed is treated as stable, so its first fault backs off from
    /// the initial interval.
    pub fn is_stable(&self) -> bool {
        self.samples.iter().all(|state| *state == FeedState::Normal)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_window_is_stable() {
        assert!(StateWindow::new(4).is_stable());
    }

    #[test]
    fn any_abnormal_sample_breaks_stability() {
        let mut window = StateWindow::new(4);
        window.push(FeedState::Normal);
        window.push(FeedState::Normal);
        assert!(window.is_stable());

        window.push(FeedState::Error);
        assert!(!window.is_stable());
    }

    #[test]
    fn old_samples_age_out() {
        let mut window = StateWindow::new(3);
        window.push(FeedState::Error);
        for _ in 0..3 {
            window.push(FeedState::Normal);
        }
        // The error sample has been displaced by three normal ones.
        assert!(window.is_stable());
    }
}
