use super::types::{ControllerStateId, SuiteTerminal, VerdictReason};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ControllerTraceSample {
    pub now_ms: u64,
    pub state_id: ControllerStateId,
    pub accel_samples: u32,
    pub gyro_samples: u32,
    pub dropped_out_of_order: u32,
    pub queue_overflows: u32,
    pub live_subscriptions: u8,
    pub countdown_remaining_s: u8,
    pub step_index: u8,
    pub simulated: u8,
    pub last_reason: VerdictReason,
    pub last_score: f32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SuiteTraceSample {
    pub terminal: SuiteTerminal,
    pub current_index: u8,
    pub abnormal_count: u8,
    pub completed: u8,
    pub cancelled: u8,
}
