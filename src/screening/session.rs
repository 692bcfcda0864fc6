use log::{info, warn};

use super::{
    config::{ConfigError, ScreeningConfig, TestProfile},
    controller::{ControllerOutput, TestController},
    orchestrator::{
        OrchestrationState, SuiteAction, SuiteApplyStatus, SuiteOrchestrator, SuiteRecordResult,
    },
    sensor::SensorProvider,
    types::{SuiteTerminal, TestOutcome, TestResult},
};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionContext {
    pub subject_id: Option<String>,
}

// Presentation-side collaborator. Placing calls or navigating to an
// emergency screen is the implementor's job.
pub trait ResultSink {
    fn on_test_result(&mut self, context: &SessionContext, index: usize, result: &TestResult);

    fn on_test_cancelled(&mut self, context: &SessionContext, index: usize, test_name: &str) {
        let _ = (context, index, test_name);
    }

    fn on_suite_finished(&mut self, context: &SessionContext, state: &OrchestrationState);

    fn on_emergency(&mut self, context: &SessionContext, state: &OrchestrationState);
}

pub type ProviderFactory = Box<dyn FnMut(&TestProfile) -> Box<dyn SensorProvider>>;

#[derive(Clone, Debug, Default)]
pub struct SessionOutput {
    pub test: ControllerOutput,
    pub suite: Option<SuiteRecordResult>,
    pub next: Option<ControllerOutput>,
}

pub struct ScreeningSession {
    context: SessionContext,
    profiles: Vec<TestProfile>,
    difficulty: Option<u8>,
    orchestrator: SuiteOrchestrator,
    controller: Option<TestController>,
    providers: ProviderFactory,
    sink: Box<dyn ResultSink>,
}

impl ScreeningSession {
    pub fn new(
        config: &ScreeningConfig,
        context: SessionContext,
        providers: ProviderFactory,
        sink: Box<dyn ResultSink>,
    ) -> Result<Self, ConfigError> {
        let profiles = config
            .suite_profiles()?
            .into_iter()
            .cloned()
            .collect();
        Ok(Self {
            context,
            profiles,
            difficulty: None,
            orchestrator: SuiteOrchestrator::from_config(&config.suite),
            controller: None,
            providers,
            sink,
        })
    }

    pub fn with_difficulty(mut self, difficulty: Option<u8>) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn state(&self) -> &OrchestrationState {
        self.orchestrator.state()
    }

    pub fn terminal(&self) -> SuiteTerminal {
        self.orchestrator.terminal()
    }

    pub fn active_test(&self) -> Option<&str> {
        self.controller
            .as_ref()
            .map(|controller| controller.profile().name.as_str())
    }

    pub fn active_controller(&self) -> Option<&TestController> {
        self.controller.as_ref()
    }

    // Starts the test at the orchestrator's current index unless one is
    // already active or the suite has finished.
    pub fn start(&mut self, now_ms: u64) -> SessionOutput {
        if self.controller.is_some() || self.orchestrator.terminal().is_terminal() {
            return SessionOutput::default();
        }
        let test = self.launch(now_ms).unwrap_or_default();
        self.settle(now_ms, test)
    }

    pub fn tick(&mut self, now_ms: u64) -> SessionOutput {
        self.forward(now_ms, |controller| controller.tick(now_ms))
    }

    pub fn observe_step(&mut self, now_ms: u64, matched: bool) -> SessionOutput {
        self.forward(now_ms, |controller| controller.observe_step(now_ms, matched))
    }

    pub fn submit_external(&mut self, now_ms: u64, score: f32, is_abnormal: bool) -> SessionOutput {
        self.forward(now_ms, |controller| {
            controller.submit_external(now_ms, score, is_abnormal)
        })
    }

    // Cancels the active test. The suite moves on to the next test and the
    // cancelled one never counts toward the quorum.
    pub fn stop(&mut self, now_ms: u64) -> SessionOutput {
        self.forward(now_ms, |controller| controller.cancel(now_ms))
    }

    fn forward(
        &mut self,
        now_ms: u64,
        call: impl FnOnce(&mut TestController) -> ControllerOutput,
    ) -> SessionOutput {
        let Some(controller) = self.controller.as_mut() else {
            return SessionOutput::default();
        };
        let test = call(controller);
        self.settle(now_ms, test)
    }

    fn launch(&mut self, now_ms: u64) -> Option<ControllerOutput> {
        let index = self.orchestrator.current_index();
        let Some(profile) = self.profiles.get(index).cloned() else {
            warn!("session: no profile for test {index}");
            return None;
        };
        // The previous controller (and its subscriptions) must be gone before
        // the next one is built.
        self.controller = None;
        let provider = (self.providers)(&profile);
        info!("session: starting '{}' ({index})", profile.name);
        let mut controller = TestController::with_difficulty(profile, self.difficulty, provider);
        let output = controller.start(now_ms);
        self.controller = Some(controller);
        Some(output)
    }

    fn settle(&mut self, now_ms: u64, test: ControllerOutput) -> SessionOutput {
        let mut output = SessionOutput {
            test,
            suite: None,
            next: None,
        };
        let index = self.orchestrator.current_index();

        let outcome = if let Some(result) = output.test.completed() {
            self.sink.on_test_result(&self.context, index, result);
            TestOutcome::Completed(result.clone())
        } else if output.test.cancelled() {
            let test_name = self.active_test().unwrap_or_default().to_string();
            self.sink.on_test_cancelled(&self.context, index, &test_name);
            TestOutcome::Cancelled {
                test_name,
                at_ms: now_ms,
            }
        } else {
            return output;
        };

        let record = self.orchestrator.record(index, outcome);
        output.suite = Some(record);
        if record.status != SuiteApplyStatus::Applied {
            warn!("session: orchestrator rejected outcome for test {index}");
            return output;
        }

        match record.action {
            Some(SuiteAction::Advance { .. }) => {
                // A test that finishes during its own start (fail-safe with no
                // countdown) is settled right away. The caller sees the latest
                // suite record and the furthest test that was started.
                if let Some(next) = self.launch(now_ms) {
                    let nested = self.settle(now_ms, next);
                    if nested.suite.is_some() {
                        output.suite = nested.suite;
                    }
                    output.next = Some(nested.next.unwrap_or(nested.test));
                }
            }
            Some(SuiteAction::Emergency) => {
                self.controller = None;
                self.sink.on_emergency(&self.context, self.orchestrator.state());
                self.sink
                    .on_suite_finished(&self.context, self.orchestrator.state());
            }
            Some(SuiteAction::AllNormal) => {
                self.controller = None;
                self.sink
                    .on_suite_finished(&self.context, self.orchestrator.state());
            }
            None => {}
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::screening::{
        config::active_config,
        sensor::{ManualSensor, SensorError},
        types::{Sample, SensorChannel},
    };

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Rc<RefCell<Vec<String>>>,
    }

    impl ResultSink for RecordingSink {
        fn on_test_result(&mut self, context: &SessionContext, index: usize, result: &TestResult) {
            self.events.borrow_mut().push(format!(
                "{}:result:{index}:{}:{}",
                context.subject_id.as_deref().unwrap_or("-"),
                result.test_name,
                result.verdict.is_abnormal
            ));
        }

        fn on_test_cancelled(&mut self, _: &SessionContext, index: usize, test_name: &str) {
            self.events
                .borrow_mut()
                .push(format!("cancelled:{index}:{test_name}"));
        }

        fn on_suite_finished(&mut self, _: &SessionContext, state: &OrchestrationState) {
            self.events
                .borrow_mut()
                .push(format!("finished:{:?}", state.terminal));
        }

        fn on_emergency(&mut self, _: &SessionContext, state: &OrchestrationState) {
            self.events
                .borrow_mut()
                .push(format!("emergency:{}", state.abnormal_count));
        }
    }

    fn session(sensor: &ManualSensor, sink: &RecordingSink) -> ScreeningSession {
        let config = active_config().expect("default config should validate");
        let feed = sensor.clone();
        ScreeningSession::new(
            config,
            SessionContext {
                subject_id: Some("p1".into()),
            },
            Box::new(move |_: &TestProfile| -> Box<dyn SensorProvider> {
                Box::new(feed.clone())
            }),
            Box::new(sink.clone()),
        )
        .expect("default suite should resolve")
    }

    fn run_still_balance(session: &mut ScreeningSession, sensor: &ManualSensor) -> SessionOutput {
        session.start(0);
        session.tick(3_000);
        for i in 0..50u64 {
            let now = 3_000 + i * 20;
            sensor.push(SensorChannel::Accel, Sample::new(now, 0.0, 0.0, 9.8));
            sensor.push(SensorChannel::Gyro, Sample::new(now, 0.0, 0.0, 0.0));
        }
        session.tick(13_000)
    }

    #[test]
    fn completed_test_hands_over_to_next_controller() {
        let sensor = ManualSensor::new();
        let sink = RecordingSink::default();
        let mut session = session(&sensor, &sink);

        let out = run_still_balance(&mut session, &sensor);
        assert_eq!(
            out.suite.map(|s| s.action),
            Some(Some(SuiteAction::Advance { next_index: 1 }))
        );
        assert!(out.next.is_some());
        assert_eq!(session.active_test(), Some("Eye Tracking"));
        assert_eq!(sensor.live_subscriptions(), 0);
        assert_eq!(sink.events.borrow().as_slice(), &["p1:result:0:Balance:false"]);
    }

    #[test]
    fn two_abnormal_results_raise_emergency_and_stop_the_suite() {
        let sensor = ManualSensor::new();
        let sink = RecordingSink::default();
        let mut session = session(&sensor, &sink);

        session.start(0);
        session.tick(3_000);
        for i in 0..50u64 {
            let now = 3_000 + i * 20;
            let sway = if i % 2 == 0 { 0.0 } else { 5.0 };
            sensor.push(SensorChannel::Accel, Sample::new(now, sway, 0.0, 9.8));
            sensor.push(SensorChannel::Gyro, Sample::new(now, 0.0, 0.0, 0.0));
        }
        session.tick(13_000);
        assert_eq!(session.state().abnormal_count, 1);
        assert_eq!(session.active_test(), Some("Eye Tracking"));

        // Eye tracking: no direction is ever matched.
        session.tick(16_000);
        session.tick(19_000);
        let out = session.tick(22_000);
        assert_eq!(out.suite.and_then(|s| s.action), Some(SuiteAction::Emergency));
        assert_eq!(session.terminal(), SuiteTerminal::Emergency);
        assert_eq!(session.active_test(), None);
        assert!(session.start(23_000).suite.is_none());

        let events = sink.events.borrow();
        assert!(events.iter().any(|e| e == "emergency:2"));
        assert_eq!(events.last().map(String::as_str), Some("finished:Emergency"));
        assert!(!events.iter().any(|e| e.contains("Speech")));
    }

    #[test]
    fn stopped_test_is_skipped_without_counting() {
        let sensor = ManualSensor::new();
        let sink = RecordingSink::default();
        let mut session = session(&sensor, &sink);

        session.start(0);
        session.tick(3_000);
        assert_eq!(sensor.live_subscriptions(), 2);
        let out = session.stop(4_000);
        assert!(out.test.cancelled());
        assert_eq!(sensor.live_subscriptions(), 0);
        assert_eq!(session.active_test(), Some("Eye Tracking"));
        assert_eq!(session.state().abnormal_count, 0);
        assert_eq!(session.state().cancelled_count, 1);
        assert_eq!(sink.events.borrow().as_slice(), &["cancelled:0:Balance"]);
    }

    #[test]
    fn test_failing_during_its_own_start_reports_the_final_suite_action() {
        let config = ScreeningConfig::from_toml_str(
            r#"
[suite]
quorum = 2
tests = ["Speech", "Still"]

[[profiles]]
name = "Speech"
kind = "external"
countdown_ms = 0
capture_ms = 5000

[profiles.thresholds]
score_threshold = 0.5
terms = [{ metric = "external_score", weight = 1.0 }]

[[profiles]]
name = "Still"
kind = "motion"
countdown_ms = 0
capture_ms = 2000
channels = ["accel"]
fallback = "fail_safe"

[profiles.thresholds]
score_threshold = 5.0
terms = [{ metric = "shake_event_count", weight = 1.0, limit = 5.0 }]
"#,
        )
        .expect("inline suite should validate");
        let sensor = ManualSensor::new();
        let sink = RecordingSink::default();
        let feed = sensor.clone();
        let mut session = ScreeningSession::new(
            &config,
            SessionContext::default(),
            Box::new(move |_: &TestProfile| -> Box<dyn SensorProvider> {
                Box::new(feed.clone())
            }),
            Box::new(sink.clone()),
        )
        .expect("suite should resolve");

        session.start(0);
        assert_eq!(session.active_test(), Some("Speech"));
        sensor.set_denied(Some(SensorError::PermissionDenied));

        let out = session.submit_external(500, 0.9, true);
        assert_eq!(out.suite.and_then(|s| s.action), Some(SuiteAction::Emergency));
        assert_eq!(session.terminal(), SuiteTerminal::Emergency);
        let still = out.next.expect("the fail-safe test was started");
        assert_eq!(
            still.completed().map(|r| r.test_name.as_str()),
            Some("Still")
        );
        assert_eq!(
            sink.events.borrow().as_slice(),
            &[
                "-:result:0:Speech:true",
                "-:result:1:Still:true",
                "emergency:2",
                "finished:Emergency",
            ]
        );
    }

    #[test]
    fn dropping_the_session_tears_down_the_active_test() {
        let sensor = ManualSensor::new();
        let sink = RecordingSink::default();
        {
            let mut session = session(&sensor, &sink);
            session.start(0);
            session.tick(3_000);
            assert_eq!(sensor.live_subscriptions(), 2);
        }
        assert_eq!(sensor.live_subscriptions(), 0);
    }
}
