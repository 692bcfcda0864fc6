use log::{info, warn};
use statig::{blocking::IntoStateMachineExt as _, prelude::*};

use super::{
    config::SuiteConfig,
    trace::SuiteTraceSample,
    types::{SuiteTerminal, TestOutcome, TestResult},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuiteApplyStatus {
    Applied,
    InvalidTransition,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuiteAction {
    Advance { next_index: usize },
    AllNormal,
    Emergency,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SuiteRecordResult {
    pub status: SuiteApplyStatus,
    pub action: Option<SuiteAction>,
    pub trace: SuiteTraceSample,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrchestrationState {
    pub results: Vec<TestResult>,
    pub abnormal_count: u32,
    pub cancelled_count: u32,
    pub current_index: usize,
    pub terminal: SuiteTerminal,
}

#[derive(Clone, Debug)]
enum SuiteEvent {
    Finished { index: usize, outcome: TestOutcome },
}

struct DispatchContext {
    status: SuiteApplyStatus,
    action: Option<SuiteAction>,
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self {
            status: SuiteApplyStatus::InvalidTransition,
            action: None,
        }
    }
}

pub struct SuiteOrchestrator {
    machine: statig::blocking::StateMachine<SuiteMachine>,
}

impl SuiteOrchestrator {
    pub fn new(test_names: Vec<String>, quorum: u32) -> Self {
        Self {
            machine: SuiteMachine::new(test_names, quorum).state_machine(),
        }
    }

    pub fn from_config(suite: &SuiteConfig) -> Self {
        Self::new(suite.tests.clone(), suite.quorum)
    }

    // Feeds the terminal outcome of the test at `index`. Outcomes for any
    // index other than the current one, or after the suite finished, are
    // rejected without touching the state.
    pub fn record(&mut self, index: usize, outcome: TestOutcome) -> SuiteRecordResult {
        let mut context = DispatchContext::default();
        self.machine
            .handle_with_context(&SuiteEvent::Finished { index, outcome }, &mut context);
        SuiteRecordResult {
            status: context.status,
            action: context.action,
            trace: self.trace(),
        }
    }

    pub fn state(&self) -> &OrchestrationState {
        &self.machine.inner().state
    }

    pub fn terminal(&self) -> SuiteTerminal {
        self.state().terminal
    }

    pub fn abnormal_count(&self) -> u32 {
        self.state().abnormal_count
    }

    pub fn current_index(&self) -> usize {
        self.state().current_index
    }

    pub fn results(&self) -> &[TestResult] {
        &self.state().results
    }

    pub fn quorum(&self) -> u32 {
        self.machine.inner().quorum
    }

    pub fn test_names(&self) -> &[String] {
        &self.machine.inner().test_names
    }

    pub fn current_test(&self) -> Option<&str> {
        if self.terminal().is_terminal() {
            return None;
        }
        self.test_names()
            .get(self.current_index())
            .map(String::as_str)
    }

    pub fn trace(&self) -> SuiteTraceSample {
        let state = self.state();
        SuiteTraceSample {
            terminal: state.terminal,
            current_index: state.current_index.min(u8::MAX as usize) as u8,
            abnormal_count: state.abnormal_count.min(u32::from(u8::MAX)) as u8,
            completed: state.results.len().min(u8::MAX as usize) as u8,
            cancelled: state.cancelled_count.min(u32::from(u8::MAX)) as u8,
        }
    }
}

struct SuiteMachine {
    test_names: Vec<String>,
    quorum: u32,
    state: OrchestrationState,
}

impl SuiteMachine {
    fn new(test_names: Vec<String>, quorum: u32) -> Self {
        Self {
            test_names,
            quorum: quorum.max(1),
            state: OrchestrationState::default(),
        }
    }

    fn is_last(&self, index: usize) -> bool {
        index + 1 >= self.test_names.len()
    }

    fn accepts(&self, index: usize, outcome: &TestOutcome) -> bool {
        if index != self.state.current_index {
            warn!(
                "suite: outcome for test {index} while test {} is active",
                self.state.current_index
            );
            return false;
        }
        match self.test_names.get(index) {
            Some(name) if name == outcome.test_name() => true,
            _ => {
                warn!(
                    "suite: outcome '{}' does not match test {index}",
                    outcome.test_name()
                );
                false
            }
        }
    }
}

#[state_machine(initial = "State::running()")]
impl SuiteMachine {
    #[state]
    fn running(&mut self, context: &mut DispatchContext, event: &SuiteEvent) -> Outcome<State> {
        let SuiteEvent::Finished { index, outcome } = event;
        if !self.accepts(*index, outcome) {
            return Handled;
        }
        context.status = SuiteApplyStatus::Applied;

        match outcome {
            TestOutcome::Completed(result) => {
                if result.verdict.is_abnormal {
                    self.state.abnormal_count += 1;
                }
                self.state.results.push(result.clone());
                if self.state.abnormal_count >= self.quorum {
                    self.state.terminal = SuiteTerminal::Emergency;
                    info!(
                        "suite: emergency after '{}' ({} of quorum {})",
                        result.test_name, self.state.abnormal_count, self.quorum
                    );
                    context.action = Some(SuiteAction::Emergency);
                    return Transition(State::emergency());
                }
            }
            TestOutcome::Cancelled { test_name, .. } => {
                self.state.cancelled_count += 1;
                info!("suite: '{test_name}' cancelled, not counted");
            }
        }

        if self.is_last(*index) {
            self.state.terminal = SuiteTerminal::AllNormal;
            info!(
                "suite: finished below quorum ({} of {})",
                self.state.abnormal_count, self.quorum
            );
            context.action = Some(SuiteAction::AllNormal);
            return Transition(State::all_normal());
        }

        self.state.current_index = index + 1;
        context.action = Some(SuiteAction::Advance {
            next_index: self.state.current_index,
        });
        Handled
    }

    #[state(superstate = "finished")]
    fn all_normal() -> Outcome<State> {
        Super
    }

    #[state(superstate = "finished")]
    fn emergency() -> Outcome<State> {
        Super
    }

    #[superstate]
    fn finished(&mut self, event: &SuiteEvent) -> Outcome<State> {
        let SuiteEvent::Finished { index, outcome } = event;
        warn!(
            "suite: '{}' at {index} ignored, suite already {:?}",
            outcome.test_name(),
            self.state.terminal
        );
        Handled
    }
}
