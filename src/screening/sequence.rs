use log::debug;
use serde::Deserialize;

use super::{
    config::SequenceConfig,
    types::{MetricKind, MetricSet},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
pub enum GazeDirection {
    Left,
    Right,
    Up,
    Down,
    #[serde(rename = "Up-Left")]
    UpLeft,
    #[serde(rename = "Up-Right")]
    UpRight,
    #[serde(rename = "Down-Left")]
    DownLeft,
    #[serde(rename = "Down-Right")]
    DownRight,
}

impl GazeDirection {
    pub const ALL: [GazeDirection; 8] = [
        Self::Left,
        Self::Right,
        Self::Up,
        Self::Down,
        Self::UpLeft,
        Self::UpRight,
        Self::DownLeft,
        Self::DownRight,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Self::Left => "Left",
            Self::Right => "Right",
            Self::Up => "Up",
            Self::Down => "Down",
            Self::UpLeft => "Up-Left",
            Self::UpRight => "Up-Right",
            Self::DownLeft => "Down-Left",
            Self::DownRight => "Down-Right",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StepRecord {
    pub index: usize,
    pub direction: GazeDirection,
    pub matched: bool,
}

#[derive(Clone, Debug)]
pub struct SequenceTracker {
    directions: Vec<GazeDirection>,
    step_ms: u64,
    early_exit_after: u32,
    index: usize,
    step_started_ms: u64,
    current_matched: bool,
    matched: u32,
    misses: u32,
    consecutive_misses: u32,
    max_consecutive_misses: u32,
    early_exit: bool,
}

impl SequenceTracker {
    pub fn new(config: &SequenceConfig) -> Self {
        Self {
            directions: config.directions.clone(),
            step_ms: config.step_ms,
            early_exit_after: config.early_exit_consecutive_misses,
            index: 0,
            step_started_ms: 0,
            current_matched: false,
            matched: 0,
            misses: 0,
            consecutive_misses: 0,
            max_consecutive_misses: 0,
            early_exit: false,
        }
    }

    pub fn begin(&mut self, now_ms: u64) {
        self.index = 0;
        self.step_started_ms = now_ms;
        self.current_matched = false;
        self.matched = 0;
        self.misses = 0;
        self.consecutive_misses = 0;
        self.max_consecutive_misses = 0;
        self.early_exit = false;
    }

    pub fn current(&self) -> Option<GazeDirection> {
        if self.is_finished() {
            return None;
        }
        self.directions.get(self.index).copied()
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    // A positive observation latches for the rest of the step; negative ones
    // are informational only, the miss is decided at the step deadline.
    pub fn observe(&mut self, matched: bool) -> bool {
        if self.current().is_none() {
            return false;
        }
        if matched {
            self.current_matched = true;
        }
        true
    }

    // Closes at most one step whose deadline has passed. Callers loop until
    // `None` to catch up after a long gap between ticks.
    pub fn poll(&mut self, now_ms: u64) -> Option<StepRecord> {
        let direction = self.current()?;
        let deadline = self.step_started_ms.saturating_add(self.step_ms);
        if now_ms < deadline {
            return None;
        }

        let record = StepRecord {
            index: self.index,
            direction,
            matched: self.current_matched,
        };
        if record.matched {
            self.matched += 1;
            self.consecutive_misses = 0;
        } else {
            self.misses += 1;
            self.consecutive_misses += 1;
            self.max_consecutive_misses = self.max_consecutive_misses.max(self.consecutive_misses);
            if self.consecutive_misses >= self.early_exit_after {
                self.early_exit = true;
            }
        }
        debug!(
            "sequence step {} {} matched={}",
            record.index,
            direction.label(),
            record.matched
        );

        self.index += 1;
        self.step_started_ms = deadline;
        self.current_matched = false;
        Some(record)
    }

    pub fn is_finished(&self) -> bool {
        self.early_exit || self.index >= self.directions.len()
    }

    pub fn early_exit(&self) -> bool {
        self.early_exit
    }

    pub fn steps_evaluated(&self) -> usize {
        self.index
    }

    pub fn metrics(&self) -> MetricSet {
        if self.index == 0 {
            return MetricSet::insufficient();
        }
        MetricSet::new()
            .with(MetricKind::TotalMisses, self.misses as f32)
            .with(
                MetricKind::MaxConsecutiveMisses,
                self.max_consecutive_misses as f32,
            )
            .with(
                MetricKind::MissRatio,
                self.misses as f32 / self.index as f32,
            )
    }
}
