use std::{cell::RefCell, rc::Rc};

use strokescreen::screening::{
    active_config, classify,
    features::compute_metrics,
    orchestrator::OrchestrationState,
    sensor::SensorProvider,
    types::{SuiteTerminal, TestResult},
    ManualSensor, MetricKind, ResultSink, Sample, ScreeningSession, SensorChannel,
    SessionContext, TestController, TestProfile,
};

fn profile(name: &str) -> TestProfile {
    active_config()
        .expect("default config should validate")
        .profile(name)
        .expect("profile should exist")
        .clone()
}

fn run_stillness(samples: &[(f32, f32, f32)], spacing_ms: u64) -> TestResult {
    let sensor = ManualSensor::new();
    let mut ctl = TestController::new(profile("Stillness"), Box::new(sensor.clone()));
    ctl.start(0);
    ctl.tick(3_000);
    for (i, &(x, y, z)) in samples.iter().enumerate() {
        let now = 3_000 + i as u64 * spacing_ms;
        assert!(sensor.push(SensorChannel::Accel, Sample::new(now, x, y, z)));
        if i % 10 == 9 {
            ctl.tick(now);
        }
    }
    ctl.tick(18_000)
        .completed()
        .cloned()
        .expect("stillness capture should complete")
}

#[test]
fn scenario_a_no_motion_is_normal() {
    let samples = vec![(0.0, 0.0, 9.8); 100];
    let result = run_stillness(&samples, 150);
    assert_eq!(result.metrics.get(MetricKind::ShakeEventCount), Some(0.0));
    assert!(!result.verdict.is_abnormal);
}

#[test]
fn scenario_b_sustained_shaking_is_abnormal() {
    let samples: Vec<(f32, f32, f32)> = (0..10)
        .map(|i| if i % 2 == 0 { (5.0, 5.0, 5.0) } else { (-5.0, -5.0, -5.0) })
        .collect();
    let result = run_stillness(&samples, 100);
    let count = result
        .metrics
        .get(MetricKind::ShakeEventCount)
        .expect("shake count computed");
    assert!(count >= 8.0);
    assert!(result.verdict.is_abnormal);

    // Same verdict straight from the extractor and classifier.
    let stillness = profile("Stillness");
    let buffer: Vec<Sample> = samples
        .iter()
        .enumerate()
        .map(|(i, &(x, y, z))| Sample::new(i as u64 * 100, x, y, z))
        .collect();
    let table = stillness.threshold_table(None);
    let metrics = compute_metrics(&buffer, &[], table.metrics(), &stillness.extractor);
    assert_eq!(classify(&metrics, table), result.verdict);
}

#[derive(Clone, Default)]
struct SuiteLog {
    results: Rc<RefCell<Vec<(usize, String, bool)>>>,
    finished: Rc<RefCell<Option<SuiteTerminal>>>,
    emergencies: Rc<RefCell<u32>>,
}

impl ResultSink for SuiteLog {
    fn on_test_result(&mut self, _: &SessionContext, index: usize, result: &TestResult) {
        self.results.borrow_mut().push((
            index,
            result.test_name.clone(),
            result.verdict.is_abnormal,
        ));
    }

    fn on_suite_finished(&mut self, _: &SessionContext, state: &OrchestrationState) {
        *self.finished.borrow_mut() = Some(state.terminal);
    }

    fn on_emergency(&mut self, _: &SessionContext, _: &OrchestrationState) {
        *self.emergencies.borrow_mut() += 1;
    }
}

fn session(sensor: &ManualSensor, log: &SuiteLog) -> ScreeningSession {
    let feed = sensor.clone();
    ScreeningSession::new(
        active_config().expect("default config should validate"),
        SessionContext::default(),
        Box::new(move |_: &TestProfile| -> Box<dyn SensorProvider> { Box::new(feed.clone()) }),
        Box::new(log.clone()),
    )
    .expect("default suite should resolve")
}

// Balance: 3 s countdown then a 10 s capture starting at `start_ms`.
fn run_balance(session: &mut ScreeningSession, sensor: &ManualSensor, start_ms: u64, sway: f32) {
    session.tick(start_ms + 3_000);
    for i in 0..50u64 {
        let now = start_ms + 3_000 + i * 20;
        let x = if i % 2 == 0 { 0.0 } else { sway };
        sensor.push(SensorChannel::Accel, Sample::new(now, x, 0.0, 9.8));
        sensor.push(SensorChannel::Gyro, Sample::new(now, 0.0, 0.0, 0.0));
    }
    session.tick(start_ms + 13_000);
}

#[test]
fn scenario_c_second_abnormal_on_last_test_raises_emergency() {
    let sensor = ManualSensor::new();
    let log = SuiteLog::default();
    let mut session = session(&sensor, &log);

    session.start(0);
    run_balance(&mut session, &sensor, 0, 0.0);
    assert_eq!(session.active_test(), Some("Eye Tracking"));

    // Eye tracking starts at 13 s; two unmatched steps end it early.
    session.tick(16_000);
    session.tick(19_000);
    session.tick(22_000);
    assert_eq!(session.active_test(), Some("Speech"));
    assert_eq!(session.terminal(), SuiteTerminal::Running);

    session.tick(25_000);
    let out = session.submit_external(30_000, 0.9, true);
    assert!(out.next.is_none());

    assert_eq!(session.terminal(), SuiteTerminal::Emergency);
    assert_eq!(session.state().abnormal_count, 2);
    assert_eq!(session.state().current_index, 2);
    assert_eq!(session.active_test(), None);
    assert_eq!(*log.emergencies.borrow(), 1);
    assert_eq!(*log.finished.borrow(), Some(SuiteTerminal::Emergency));
    assert_eq!(
        log.results.borrow().as_slice(),
        &[
            (0, "Balance".to_string(), false),
            (1, "Eye Tracking".to_string(), true),
            (2, "Speech".to_string(), true),
        ]
    );
}

#[test]
fn scenario_d_cancelled_test_does_not_count() {
    let sensor = ManualSensor::new();
    let log = SuiteLog::default();
    let mut session = session(&sensor, &log);

    session.start(0);
    run_balance(&mut session, &sensor, 0, 5.0);
    assert_eq!(session.state().abnormal_count, 1);

    session.tick(16_000);
    let out = session.stop(17_000);
    assert!(out.test.cancelled());
    assert_eq!(session.active_test(), Some("Speech"));

    session.tick(20_000);
    session.submit_external(22_000, 0.1, false);

    assert_eq!(session.terminal(), SuiteTerminal::AllNormal);
    assert_eq!(session.state().abnormal_count, 1);
    assert_eq!(session.state().cancelled_count, 1);
    assert_eq!(session.state().results.len(), 2);
    assert_eq!(*log.emergencies.borrow(), 0);
    assert_eq!(*log.finished.borrow(), Some(SuiteTerminal::AllNormal));
    assert_eq!(sensor.live_subscriptions(), 0);
}
