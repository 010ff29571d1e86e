//! Host-level rolling-bit window state machine.
//!
//! Ingests one bit per detection tick (host rate above its threshold or
//! not) and classifies the stream into three states based on the windowed
//! popcount. The falling edge out of `AboveThreshold` closes an anomaly
//! event; the length reported with it is the length of the closed run.

use super::bits::RollingBitCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowState {
    /// The window has not wrapped yet; no classification.
    NotFilled,
    /// Windowed popcount below the threshold.
    BelowThreshold,
    /// Windowed popcount at or above the threshold.
    AboveThreshold,
}

/// `(previous state, new state)` for one insert.
pub type Edge = (WindowState, WindowState);

#[derive(Debug)]
pub struct RollingBitWindow {
    min_length: usize,
    threshold: usize,
    state: WindowState,
    length: usize,
    counter: RollingBitCounter,
}

impl RollingBitWindow {
    pub fn new(min_length: usize, threshold: usize) -> Self {
        assert!(
            threshold <= min_length,
            "window threshold must not exceed window length"
        );
        Self {
            min_length,
            threshold,
            state: WindowState::NotFilled,
            length: 0,
            counter: RollingBitCounter::new(min_length),
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Push one bit. Returns the traversed edge and the run length as it
    /// was *before* the transition applied, so a falling edge out of
    /// `AboveThreshold` carries the length of the run it closes.
    pub fn insert(&mut self, bit: bool) -> (Edge, usize) {
        use WindowState::*;

        let prev_length = self.length;
        let prev_state = self.state;

        self.counter.insert(bit);
        let above = self.counter.set_bits() >= self.threshold;

        self.state = match prev_state {
            NotFilled if !self.counter.is_filled() => NotFilled,
            NotFilled | BelowThreshold | AboveThreshold => {
                if above {
                    AboveThreshold
                } else {
                    BelowThreshold
                }
            }
        };

        self.length = match (prev_state, self.state) {
            // Growing: still filling, or extending an anomalous run.
            (NotFilled, NotFilled)
            | (NotFilled, AboveThreshold)
            | (AboveThreshold, AboveThreshold) => self.length + 1,
            // Every other edge re-anchors the run at the window length.
            _ => self.min_length,
        };

        ((prev_state, self.state), prev_length)
    }
}
