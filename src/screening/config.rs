use std::{collections::BTreeSet, fmt, fs, path::Path, sync::OnceLock};

use serde::Deserialize;

use super::{
    sequence::GazeDirection,
    types::{MetricKind, SensorChannel},
};

pub const MAX_DIFFICULTY_TIERS: usize = 6;
// A late tick can close every step at once; the controller's action buffer
// has to hold all of them plus the capture and result actions.
pub const MAX_SEQUENCE_STEPS: usize = 12;

const SEQUENCE_METRICS: [MetricKind; 3] = [
    MetricKind::TotalMisses,
    MetricKind::MaxConsecutiveMisses,
    MetricKind::MissRatio,
];
const EXTERNAL_METRICS: [MetricKind; 1] = [MetricKind::ExternalScore];

const DEFAULT_CONFIG_TOML: &str = include_str!("../../config/screening.toml");

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Validation(String),
    UnknownProfile(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "io error: {msg}"),
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::UnknownProfile(name) => write!(f, "unknown test profile '{name}'"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Motion,
    Sequence,
    External,
}

impl TestKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Motion => "motion",
            Self::Sequence => "sequence",
            Self::External => "external",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    Simulate,
    #[default]
    FailSafe,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExtractorParams {
    pub sampling_rate_hz: f32,
    pub shake_threshold: f32,
    pub step_peak_threshold: f32,
    pub planar_energy: bool,
}

impl Default for ExtractorParams {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 50.0,
            shake_threshold: 2.0,
            step_peak_threshold: 11.0,
            planar_energy: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct MetricTerm {
    pub metric: MetricKind,
    #[serde(default)]
    pub weight: f32,
    #[serde(default)]
    pub limit: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ThresholdTable {
    pub score_threshold: f32,
    pub terms: Vec<MetricTerm>,
}

impl ThresholdTable {
    pub fn metrics(&self) -> impl Iterator<Item = MetricKind> + '_ {
        self.terms.iter().map(|term| term.metric)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SequenceConfig {
    pub directions: Vec<GazeDirection>,
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
    #[serde(default = "default_early_exit_misses")]
    pub early_exit_consecutive_misses: u32,
}

fn default_step_ms() -> u64 {
    3_000
}

fn default_early_exit_misses() -> u32 {
    2
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TestProfile {
    pub name: String,
    pub kind: TestKind,
    #[serde(default)]
    pub countdown_ms: u64,
    #[serde(default)]
    pub capture_ms: u64,
    #[serde(default)]
    pub channels: Vec<SensorChannel>,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    #[serde(default)]
    pub extractor: ExtractorParams,
    pub thresholds: ThresholdTable,
    #[serde(default)]
    pub tiers: Vec<ThresholdTable>,
    #[serde(default)]
    pub sequence: Option<SequenceConfig>,
}

impl TestProfile {
    // Difficulty is 1-based and clamped to the available tiers; without tiers
    // (or without a difficulty) the base table applies.
    pub fn threshold_table(&self, difficulty: Option<u8>) -> &ThresholdTable {
        match difficulty {
            Some(level) if !self.tiers.is_empty() => {
                let idx = usize::from(level.max(1)) - 1;
                &self.tiers[idx.min(self.tiers.len() - 1)]
            }
            _ => &self.thresholds,
        }
    }

    pub fn effective_capture_ms(&self) -> u64 {
        match (&self.kind, &self.sequence) {
            (TestKind::Sequence, Some(sequence)) => {
                sequence.step_ms.saturating_mul(sequence.directions.len() as u64)
            }
            _ => self.capture_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SuiteConfig {
    pub quorum: u32,
    pub tests: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ScreeningConfig {
    pub suite: SuiteConfig,
    pub profiles: Vec<TestProfile>,
}

impl ScreeningConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ScreeningConfig =
            toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        validate_config(&config)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn profile(&self, name: &str) -> Result<&TestProfile, ConfigError> {
        self.profiles
            .iter()
            .find(|profile| profile.name == name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    pub fn suite_profiles(&self) -> Result<Vec<&TestProfile>, ConfigError> {
        self.suite
            .tests
            .iter()
            .map(|name| self.profile(name))
            .collect()
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_table(name: &str, label: &str, table: &ThresholdTable) -> Result<(), ConfigError> {
    if table.terms.is_empty() {
        return Err(invalid(format!("{name}: {label}.terms must not be empty")));
    }
    if table.terms.iter().all(|term| term.weight == 0.0) {
        return Err(invalid(format!(
            "{name}: {label} must contain at least one non-zero weight"
        )));
    }
    if !table.score_threshold.is_finite()
        || table.terms.iter().any(|term| !term.weight.is_finite())
    {
        return Err(invalid(format!("{name}: {label} values must be finite")));
    }
    Ok(())
}

fn validate_produced_metrics(
    profile: &TestProfile,
    kind_label: &str,
    produced: &[MetricKind],
) -> Result<(), ConfigError> {
    let tables = core::iter::once(&profile.thresholds).chain(profile.tiers.iter());
    for metric in tables.flat_map(ThresholdTable::metrics) {
        if !produced.contains(&metric) {
            return Err(invalid(format!(
                "{}: metric {} is not produced by {kind_label} profiles",
                profile.name,
                metric.as_str()
            )));
        }
    }
    Ok(())
}

fn validate_profile(profile: &TestProfile) -> Result<(), ConfigError> {
    let name = profile.name.as_str();
    if name.trim().is_empty() {
        return Err(invalid("profile name must not be empty"));
    }

    validate_table(name, "thresholds", &profile.thresholds)?;
    if profile.tiers.len() > MAX_DIFFICULTY_TIERS {
        return Err(invalid(format!(
            "{name}: at most {MAX_DIFFICULTY_TIERS} threshold tiers are supported"
        )));
    }
    for tier in &profile.tiers {
        validate_table(name, "tiers", tier)?;
    }

    match profile.kind {
        TestKind::Motion => {
            if profile.capture_ms == 0 {
                return Err(invalid(format!("{name}: capture_ms must be > 0")));
            }
            if profile.channels.is_empty() {
                return Err(invalid(format!(
                    "{name}: motion profiles must list at least one sensor channel"
                )));
            }
            if profile.extractor.sampling_rate_hz <= 0.0 {
                return Err(invalid(format!(
                    "{name}: extractor.sampling_rate_hz must be > 0"
                )));
            }
            let tables = core::iter::once(&profile.thresholds).chain(profile.tiers.iter());
            for metric in tables.flat_map(ThresholdTable::metrics) {
                let Some(channel) = metric.source_channel() else {
                    return Err(invalid(format!(
                        "{name}: metric {} is not produced by motion profiles",
                        metric.as_str()
                    )));
                };
                if !profile.channels.contains(&channel) {
                    return Err(invalid(format!(
                        "{name}: metric {} needs the {} channel",
                        metric.as_str(),
                        channel.as_str()
                    )));
                }
            }
        }
        TestKind::Sequence => {
            let Some(sequence) = &profile.sequence else {
                return Err(invalid(format!(
                    "{name}: sequence profiles require a [sequence] table with at least one direction"
                )));
            };
            if sequence.directions.is_empty() {
                return Err(invalid(format!(
                    "{name}: sequence profiles require a [sequence] table with at least one direction"
                )));
            }
            if sequence.directions.len() > MAX_SEQUENCE_STEPS {
                return Err(invalid(format!(
                    "{name}: at most {MAX_SEQUENCE_STEPS} sequence directions are supported"
                )));
            }
            if sequence.step_ms == 0 {
                return Err(invalid(format!("{name}: sequence.step_ms must be > 0")));
            }
            if sequence.early_exit_consecutive_misses == 0 {
                return Err(invalid(format!(
                    "{name}: sequence.early_exit_consecutive_misses must be > 0"
                )));
            }
            validate_produced_metrics(profile, "sequence", &SEQUENCE_METRICS)?;
        }
        TestKind::External => {
            if profile.capture_ms == 0 {
                return Err(invalid(format!("{name}: capture_ms must be > 0")));
            }
            validate_produced_metrics(profile, "external", &EXTERNAL_METRICS)?;
        }
    }
    Ok(())
}

pub fn validate_config(config: &ScreeningConfig) -> Result<(), ConfigError> {
    let mut names = BTreeSet::new();
    for profile in &config.profiles {
        validate_profile(profile)?;
        if !names.insert(profile.name.as_str()) {
            return Err(invalid(format!(
                "profile names must be unique, '{}' repeats",
                profile.name
            )));
        }
    }

    if config.suite.tests.is_empty() {
        return Err(invalid("suite.tests must not be empty"));
    }
    if config.suite.quorum == 0 {
        return Err(invalid("suite.quorum must be >= 1"));
    }
    if config.suite.quorum as usize > config.suite.tests.len() {
        return Err(invalid("suite.quorum must be <= the number of suite tests"));
    }
    config.suite_profiles()?;
    Ok(())
}

static ACTIVE_CONFIG: OnceLock<Result<ScreeningConfig, ConfigError>> = OnceLock::new();

pub fn default_config_toml() -> &'static str {
    DEFAULT_CONFIG_TOML
}

pub fn active_config() -> Result<&'static ScreeningConfig, ConfigError> {
    ACTIVE_CONFIG
        .get_or_init(|| ScreeningConfig::from_toml_str(DEFAULT_CONFIG_TOML))
        .as_ref()
        .map_err(Clone::clone)
}
