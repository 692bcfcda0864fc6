use std::rc::Rc;

use log::{debug, info, warn};
use statig::{blocking::IntoStateMachineExt as _, prelude::*};

use super::{
    buffer::SampleBuffer,
    config::{TestKind, TestProfile},
    sensor::{SampleQueue, SensorProvider, SubscriptionHandle, SyntheticSampleGenerator},
    sequence::{GazeDirection, SequenceTracker},
    trace::ControllerTraceSample,
    types::{ControllerStateId, DataSource, SensorChannel, TestResult, VerdictReason},
};

mod helpers;

pub const MAX_CHANNELS: usize = 2;

#[derive(Clone, Debug, PartialEq)]
pub enum ControllerAction {
    CountdownTick { remaining_s: u8 },
    CaptureStarted { data_source: DataSource },
    StepAdvanced { index: usize, direction: GazeDirection, matched: bool },
    Completed(TestResult),
    Cancelled,
}

pub type ActionBuffer = heapless::Vec<ControllerAction, 16>;

#[derive(Clone, Debug, PartialEq)]
pub enum ControllerOutcome {
    Completed(TestResult),
    Cancelled,
}

#[derive(Clone, Debug, Default)]
pub struct ControllerOutput {
    pub actions: ActionBuffer,
    // Held outside `actions` so a full action buffer never loses it.
    pub outcome: Option<ControllerOutcome>,
    pub trace: ControllerTraceSample,
}

impl ControllerOutput {
    pub fn completed(&self) -> Option<&TestResult> {
        match &self.outcome {
            Some(ControllerOutcome::Completed(result)) => Some(result),
            _ => None,
        }
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.outcome, Some(ControllerOutcome::Cancelled))
    }
}

#[derive(Clone, Copy, Debug)]
enum TestEvent {
    Start { now_ms: u64 },
    Tick { now_ms: u64 },
    Cancel { now_ms: u64 },
    StepObserved { now_ms: u64, matched: bool },
    ExternalVerdict { now_ms: u64, score: f32, is_abnormal: bool },
}

#[derive(Default)]
struct DispatchContext {
    actions: ActionBuffer,
    outcome: Option<ControllerOutcome>,
}

impl DispatchContext {
    fn push(&mut self, action: ControllerAction) {
        if self.actions.push(action).is_err() {
            warn!("controller action buffer full, action dropped");
        }
    }

    fn finish(&mut self, outcome: ControllerOutcome) {
        let action = match &outcome {
            ControllerOutcome::Completed(result) => ControllerAction::Completed(result.clone()),
            ControllerOutcome::Cancelled => ControllerAction::Cancelled,
        };
        self.push(action);
        self.outcome = Some(outcome);
    }
}

pub struct TestController {
    machine: statig::blocking::StateMachine<TestHsm>,
}

impl TestController {
    pub fn new(profile: TestProfile, provider: Box<dyn SensorProvider>) -> Self {
        Self::with_difficulty(profile, None, provider)
    }

    pub fn with_difficulty(
        profile: TestProfile,
        difficulty: Option<u8>,
        provider: Box<dyn SensorProvider>,
    ) -> Self {
        Self {
            machine: TestHsm::new(profile, difficulty, provider).state_machine(),
        }
    }

    pub fn start(&mut self, now_ms: u64) -> ControllerOutput {
        self.dispatch(TestEvent::Start { now_ms })
    }

    pub fn tick(&mut self, now_ms: u64) -> ControllerOutput {
        self.dispatch(TestEvent::Tick { now_ms })
    }

    // Stops the test without a verdict: subscriptions are released and the
    // partial buffers are discarded.
    pub fn cancel(&mut self, now_ms: u64) -> ControllerOutput {
        self.dispatch(TestEvent::Cancel { now_ms })
    }

    pub fn observe_step(&mut self, now_ms: u64, matched: bool) -> ControllerOutput {
        self.dispatch(TestEvent::StepObserved { now_ms, matched })
    }

    pub fn submit_external(
        &mut self,
        now_ms: u64,
        score: f32,
        is_abnormal: bool,
    ) -> ControllerOutput {
        self.dispatch(TestEvent::ExternalVerdict {
            now_ms,
            score,
            is_abnormal,
        })
    }

    pub fn state_id(&self) -> ControllerStateId {
        self.machine.inner().state_id
    }

    pub fn result(&self) -> Option<&TestResult> {
        self.machine.inner().result.as_ref()
    }

    pub fn profile(&self) -> &TestProfile {
        &self.machine.inner().profile
    }

    pub fn live_subscriptions(&self) -> usize {
        self.machine.inner().subscriptions.len()
    }

    pub fn current_direction(&self) -> Option<GazeDirection> {
        let inner = self.machine.inner();
        if inner.state_id != ControllerStateId::Capturing {
            return None;
        }
        inner.sequence.as_ref().and_then(SequenceTracker::current)
    }

    pub fn trace(&self) -> ControllerTraceSample {
        self.machine.inner().last_trace
    }

    fn dispatch(&mut self, event: TestEvent) -> ControllerOutput {
        let mut context = DispatchContext::default();
        self.machine.handle_with_context(&event, &mut context);
        ControllerOutput {
            actions: context.actions,
            outcome: context.outcome,
            trace: self.machine.inner().last_trace,
        }
    }
}

struct TestHsm {
    profile: TestProfile,
    difficulty: Option<u8>,
    provider: Box<dyn SensorProvider>,
    queue: Rc<SampleQueue>,
    subscriptions: heapless::Vec<SubscriptionHandle, MAX_CHANNELS>,
    accel: SampleBuffer,
    gyro: SampleBuffer,
    data_source: DataSource,
    synthetic: Option<SyntheticSampleGenerator>,
    sequence: Option<SequenceTracker>,
    external: Option<(f32, bool)>,
    countdown_deadline_ms: u64,
    countdown_reported_s: u8,
    capture_deadline_ms: u64,
    state_id: ControllerStateId,
    result: Option<TestResult>,
    last_trace: ControllerTraceSample,
}

impl Drop for TestHsm {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[state_machine(initial = "State::idle()")]
impl TestHsm {
    #[state]
    fn idle(&mut self, context: &mut DispatchContext, event: &TestEvent) -> Outcome<State> {
        match event {
            TestEvent::Start { now_ms } => self.start_run(context, *now_ms),
            TestEvent::Tick { now_ms } | TestEvent::Cancel { now_ms } => {
                self.update_trace(*now_ms);
                Handled
            }
            _ => Handled,
        }
    }

    #[state(superstate = "armed")]
    fn countdown(&mut self, context: &mut DispatchContext, event: &TestEvent) -> Outcome<State> {
        match event {
            TestEvent::Tick { now_ms } => {
                if *now_ms >= self.countdown_deadline_ms {
                    return self.begin_capture(context, *now_ms);
                }
                self.report_countdown(context, *now_ms);
                self.update_trace(*now_ms);
                Handled
            }
            _ => Super,
        }
    }

    #[state(superstate = "armed")]
    fn capturing(&mut self, context: &mut DispatchContext, event: &TestEvent) -> Outcome<State> {
        match event {
            TestEvent::Tick { now_ms } => {
                if self.advance_capture(context, *now_ms) {
                    return self.finish_capture(context, *now_ms);
                }
                self.update_trace(*now_ms);
                Handled
            }
            TestEvent::StepObserved { now_ms, matched } => {
                let finished = self.advance_capture(context, *now_ms);
                if let Some(sequence) = self.sequence.as_mut() {
                    sequence.observe(*matched);
                }
                if finished {
                    return self.finish_capture(context, *now_ms);
                }
                self.update_trace(*now_ms);
                Handled
            }
            TestEvent::ExternalVerdict {
                now_ms,
                score,
                is_abnormal,
            } => {
                if self.profile.kind != TestKind::External {
                    warn!(
                        "{}: external verdict ignored for non-external test",
                        self.profile.name
                    );
                    return Handled;
                }
                self.external = Some((*score, *is_abnormal));
                self.finish_capture(context, *now_ms)
            }
            _ => Super,
        }
    }

    #[state]
    fn complete(&mut self, context: &mut DispatchContext, event: &TestEvent) -> Outcome<State> {
        match event {
            TestEvent::Start { now_ms } => self.start_run(context, *now_ms),
            _ => Handled,
        }
    }

    #[superstate]
    fn armed(&mut self, context: &mut DispatchContext, event: &TestEvent) -> Outcome<State> {
        match event {
            TestEvent::Cancel { now_ms } => {
                self.teardown();
                self.discard_capture();
                self.state_id = ControllerStateId::Idle;
                info!("{}: cancelled at {}ms", self.profile.name, now_ms);
                context.finish(ControllerOutcome::Cancelled);
                self.update_trace(*now_ms);
                Transition(State::idle())
            }
            TestEvent::Start { .. } => {
                debug!("{}: start ignored while running", self.profile.name);
                Handled
            }
            _ => Handled,
        }
    }
}

impl TestHsm {
    fn start_run(&mut self, context: &mut DispatchContext, now_ms: u64) -> Outcome<State> {
        self.arm(now_ms);
        info!(
            "{}: countdown {}ms, capture {}ms",
            self.profile.name,
            self.profile.countdown_ms,
            self.profile.effective_capture_ms()
        );
        if self.profile.countdown_ms == 0 {
            return self.begin_capture(context, now_ms);
        }
        self.report_countdown(context, now_ms);
        self.update_trace(now_ms);
        Transition(State::countdown())
    }

    fn begin_capture(&mut self, context: &mut DispatchContext, now_ms: u64) -> Outcome<State> {
        if !self.open_capture(context, now_ms) {
            self.update_trace(now_ms);
            return Transition(State::complete());
        }
        self.update_trace(now_ms);
        Transition(State::capturing())
    }

    fn finish_capture(&mut self, context: &mut DispatchContext, now_ms: u64) -> Outcome<State> {
        self.close_capture(context, now_ms);
        self.update_trace(now_ms);
        Transition(State::complete())
    }

    fn update_trace(&mut self, now_ms: u64) {
        let (last_reason, last_score) = self
            .result
            .as_ref()
            .map_or((VerdictReason::Normal, 0.0), |r| (r.verdict.reason, r.verdict.score));
        self.last_trace = ControllerTraceSample {
            now_ms,
            state_id: self.state_id,
            accel_samples: self.accel.len() as u32,
            gyro_samples: self.gyro.len() as u32,
            dropped_out_of_order: self
                .accel
                .dropped_out_of_order()
                .saturating_add(self.gyro.dropped_out_of_order()),
            queue_overflows: self.queue.overflowed(),
            live_subscriptions: self.subscriptions.len() as u8,
            countdown_remaining_s: if self.state_id == ControllerStateId::Countdown {
                Self::remaining_seconds(self.countdown_deadline_ms, now_ms)
            } else {
                0
            },
            step_index: self
                .sequence
                .as_ref()
                .map_or(0, |s| s.current_index().min(u8::MAX as usize) as u8),
            simulated: u8::from(self.data_source == DataSource::Simulated),
            last_reason,
            last_score,
        };
    }

    fn sample_buffer(&mut self, channel: SensorChannel) -> &mut SampleBuffer {
        match channel {
            SensorChannel::Accel => &mut self.accel,
            SensorChannel::Gyro => &mut self.gyro,
        }
    }
}
