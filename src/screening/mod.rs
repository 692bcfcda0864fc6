pub mod buffer;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod features;
pub mod orchestrator;
pub mod registry;
pub mod sensor;
pub mod sequence;
pub mod session;
pub mod trace;
pub mod types;

pub use classifier::classify;
pub use config::{active_config, ConfigError, ScreeningConfig, TestKind, TestProfile};
pub use controller::{ControllerAction, ControllerOutcome, ControllerOutput, TestController};
pub use orchestrator::{OrchestrationState, SuiteAction, SuiteOrchestrator};
pub use sensor::{ManualSensor, SensorError, SensorProvider};
pub use session::{ResultSink, ScreeningSession, SessionContext};
pub use types::{
    DataSource, MetricKind, MetricSet, Sample, SensorChannel, TestOutcome, TestResult, Verdict,
    VerdictReason,
};
