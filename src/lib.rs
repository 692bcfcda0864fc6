pub mod screening;

pub use screening::{
    active_config, classify, ConfigError, ScreeningConfig, ScreeningSession, SessionContext,
    SuiteOrchestrator, TestController,
};
