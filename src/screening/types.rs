use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sample {
    pub timestamp_ms: u64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Sample {
    pub const fn new(timestamp_ms: u64, x: f32, y: f32, z: f32) -> Self {
        Self {
            timestamp_ms,
            x,
            y,
            z,
        }
    }

    pub fn delta(&self, prev: &Sample) -> (f32, f32, f32) {
        (self.x - prev.x, self.y - prev.y, self.z - prev.z)
    }

    pub fn abs_sum(&self) -> f32 {
        self.x.abs() + self.y.abs() + self.z.abs()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorChannel {
    Accel,
    Gyro,
}

impl SensorChannel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accel => "accel",
            Self::Gyro => "gyro",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TaggedSample {
    pub channel: SensorChannel,
    pub sample: Sample,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    MagnitudeChangeEnergy,
    AngularTiltAccumulation,
    StepIntervalRegularity,
    ShakeEventCount,
    ShakeMaxIntensity,
    ShakeMeanIntensity,
    TotalMisses,
    MaxConsecutiveMisses,
    MissRatio,
    ExternalScore,
}

impl MetricKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MagnitudeChangeEnergy => "magnitude_change_energy",
            Self::AngularTiltAccumulation => "angular_tilt_accumulation",
            Self::StepIntervalRegularity => "step_interval_regularity",
            Self::ShakeEventCount => "shake_event_count",
            Self::ShakeMaxIntensity => "shake_max_intensity",
            Self::ShakeMeanIntensity => "shake_mean_intensity",
            Self::TotalMisses => "total_misses",
            Self::MaxConsecutiveMisses => "max_consecutive_misses",
            Self::MissRatio => "miss_ratio",
            Self::ExternalScore => "external_score",
        }
    }

    // Channel whose buffer feeds the extractor, `None` for metrics that are
    // not derived from motion samples.
    pub const fn source_channel(self) -> Option<SensorChannel> {
        match self {
            Self::MagnitudeChangeEnergy
            | Self::StepIntervalRegularity
            | Self::ShakeEventCount
            | Self::ShakeMaxIntensity
            | Self::ShakeMeanIntensity => Some(SensorChannel::Accel),
            Self::AngularTiltAccumulation => Some(SensorChannel::Gyro),
            Self::TotalMisses | Self::MaxConsecutiveMisses | Self::MissRatio => None,
            Self::ExternalScore => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricSet {
    values: BTreeMap<MetricKind, f32>,
    insufficient: bool,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insufficient() -> Self {
        Self {
            values: BTreeMap::new(),
            insufficient: true,
        }
    }

    pub fn insert(&mut self, kind: MetricKind, value: f32) {
        self.values.insert(kind, value);
    }

    pub fn with(mut self, kind: MetricKind, value: f32) -> Self {
        self.insert(kind, value);
        self
    }

    pub fn get(&self, kind: MetricKind) -> Option<f32> {
        self.values.get(&kind).copied()
    }

    pub fn mark_insufficient(&mut self) {
        self.insufficient = true;
    }

    pub fn is_insufficient(&self) -> bool {
        self.insufficient
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricKind, f32)> + '_ {
        self.values.iter().map(|(kind, value)| (*kind, *value))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VerdictReason {
    #[default]
    Normal,
    ScoreAboveThreshold,
    MetricLimit(MetricKind),
    InsufficientData,
    MalformedMetrics,
    EarlyExit,
    External,
}

impl VerdictReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::ScoreAboveThreshold => "score_above_threshold",
            Self::MetricLimit(kind) => kind.as_str(),
            Self::InsufficientData => "insufficient_data",
            Self::MalformedMetrics => "malformed_metrics",
            Self::EarlyExit => "early_exit",
            Self::External => "external",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Verdict {
    pub score: f32,
    pub is_abnormal: bool,
    pub reason: VerdictReason,
}

impl Verdict {
    pub const fn fail_safe(reason: VerdictReason) -> Self {
        Self {
            score: 0.0,
            is_abnormal: true,
            reason,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataSource {
    Sensor,
    Simulated,
    Unavailable,
    External,
}

impl DataSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Simulated => "simulated",
            Self::Unavailable => "unavailable",
            Self::External => "external",
        }
    }
}

pub const INSUFFICIENT_DATA_NOTE: &str = "insufficient data";

#[derive(Clone, Debug, PartialEq)]
pub struct TestResult {
    pub test_name: String,
    pub verdict: Verdict,
    pub completed_at_ms: u64,
    pub data_source: DataSource,
    pub metrics: MetricSet,
    pub annotation: Option<&'static str>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TestOutcome {
    Completed(TestResult),
    Cancelled { test_name: String, at_ms: u64 },
}

impl TestOutcome {
    pub fn test_name(&self) -> &str {
        match self {
            Self::Completed(result) => &result.test_name,
            Self::Cancelled { test_name, .. } => test_name,
        }
    }

    pub fn result(&self) -> Option<&TestResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Cancelled { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum ControllerStateId {
    #[default]
    Idle = 0,
    Countdown = 1,
    Capturing = 2,
    Analyzing = 3,
    Result = 4,
}

impl ControllerStateId {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum SuiteTerminal {
    #[default]
    Running = 0,
    AllNormal = 1,
    Emergency = 2,
}

impl SuiteTerminal {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}
