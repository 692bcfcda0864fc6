use core::cell::{Cell, RefCell};
use std::{fmt, rc::Rc};

use embassy_sync::{blocking_mutex::raw::NoopRawMutex, channel::Channel};
use log::warn;

use super::types::{Sample, SensorChannel, TaggedSample};

pub const SAMPLE_QUEUE_DEPTH: usize = 128;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SensorError {
    PermissionDenied,
    Unsupported,
    Busy,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => f.write_str("sensor permission denied"),
            Self::Unsupported => f.write_str("sensor unsupported on this platform"),
            Self::Busy => f.write_str("sensor already subscribed"),
        }
    }
}

impl std::error::Error for SensorError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscriptionHandle {
    pub id: u32,
    pub channel: SensorChannel,
}

pub trait SensorProvider {
    fn subscribe(
        &mut self,
        channel: SensorChannel,
        sender: SampleSender,
    ) -> Result<SubscriptionHandle, SensorError>;

    fn unsubscribe(&mut self, handle: SubscriptionHandle);
}

// Bounded hand-off between the sensor callback and the controller. Both ends
// live on the same thread, hence the no-op mutex.
pub struct SampleQueue {
    channel: Channel<NoopRawMutex, TaggedSample, SAMPLE_QUEUE_DEPTH>,
    overflowed: Cell<u32>,
}

impl SampleQueue {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            channel: Channel::new(),
            overflowed: Cell::new(0),
        })
    }

    pub fn sender(self: &Rc<Self>, channel: SensorChannel) -> SampleSender {
        SampleSender {
            queue: Rc::clone(self),
            channel,
        }
    }

    pub fn try_receive(&self) -> Option<TaggedSample> {
        self.channel.try_receive().ok()
    }

    pub fn clear(&self) {
        while self.channel.try_receive().is_ok() {}
    }

    pub fn overflowed(&self) -> u32 {
        self.overflowed.get()
    }
}

#[derive(Clone)]
pub struct SampleSender {
    queue: Rc<SampleQueue>,
    channel: SensorChannel,
}

impl SampleSender {
    pub fn channel(&self) -> SensorChannel {
        self.channel
    }

    // Never blocks: a full queue drops the sample and counts the overflow.
    pub fn send(&self, sample: Sample) -> bool {
        let tagged = TaggedSample {
            channel: self.channel,
            sample,
        };
        if self.queue.channel.try_send(tagged).is_ok() {
            return true;
        }
        let overflowed = self.queue.overflowed.get().saturating_add(1);
        self.queue.overflowed.set(overflowed);
        warn!(
            "{} sample queue full, dropped sample at {}ms",
            self.channel.as_str(),
            sample.timestamp_ms
        );
        false
    }
}

#[derive(Default)]
struct ManualSensorState {
    next_id: u32,
    denied: Option<SensorError>,
    subscriptions: Vec<(SubscriptionHandle, SampleSender)>,
    subscribe_calls: u32,
    unsubscribe_calls: u32,
}

// Provider fed by its owner: replay tools and tests push samples through a
// clone while the controller holds another clone as its provider.
#[derive(Clone, Default)]
pub struct ManualSensor {
    state: Rc<RefCell<ManualSensorState>>,
}

impl ManualSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denying(error: SensorError) -> Self {
        let sensor = Self::new();
        sensor.state.borrow_mut().denied = Some(error);
        sensor
    }

    pub fn set_denied(&self, error: Option<SensorError>) {
        self.state.borrow_mut().denied = error;
    }

    pub fn push(&self, channel: SensorChannel, sample: Sample) -> bool {
        let state = self.state.borrow();
        let Some((_, sender)) = state
            .subscriptions
            .iter()
            .find(|(handle, _)| handle.channel == channel)
        else {
            return false;
        };
        sender.send(sample)
    }

    pub fn live_subscriptions(&self) -> usize {
        self.state.borrow().subscriptions.len()
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.state.borrow().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> u32 {
        self.state.borrow().unsubscribe_calls
    }
}

impl SensorProvider for ManualSensor {
    fn subscribe(
        &mut self,
        channel: SensorChannel,
        sender: SampleSender,
    ) -> Result<SubscriptionHandle, SensorError> {
        let mut state = self.state.borrow_mut();
        state.subscribe_calls += 1;
        if let Some(error) = state.denied {
            return Err(error);
        }
        if state
            .subscriptions
            .iter()
            .any(|(handle, _)| handle.channel == channel)
        {
            return Err(SensorError::Busy);
        }
        state.next_id += 1;
        let handle = SubscriptionHandle {
            id: state.next_id,
            channel,
        };
        state.subscriptions.push((handle, sender));
        Ok(handle)
    }

    fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        let mut state = self.state.borrow_mut();
        state.unsubscribe_calls += 1;
        state.subscriptions.retain(|(live, _)| *live != handle);
    }
}

// Clearly synthetic stand-in used only when the profile opts into simulated
// data after a failed subscribe. Output is deterministic.
#[derive(Clone, Debug)]
pub struct SyntheticSampleGenerator {
    period_ms: u64,
    next_ms: u64,
    step: u32,
}

impl SyntheticSampleGenerator {
    pub const GRAVITY: f32 = 9.81;

    pub fn new(sampling_rate_hz: f32, start_ms: u64) -> Self {
        let period_ms = if sampling_rate_hz > 0.0 {
            ((1_000.0 / sampling_rate_hz) as u64).max(1)
        } else {
            20
        };
        Self {
            period_ms,
            next_ms: start_ms,
            step: 0,
        }
    }

    pub fn fill(
        &mut self,
        now_ms: u64,
        channels: &[SensorChannel],
        mut sink: impl FnMut(TaggedSample),
    ) {
        while self.next_ms <= now_ms {
            let phase = self.step as f32 * 0.4;
            for &channel in channels {
                let sample = match channel {
                    SensorChannel::Accel => Sample::new(
                        self.next_ms,
                        0.05 * phase.sin(),
                        0.05 * phase.cos(),
                        Self::GRAVITY,
                    ),
                    SensorChannel::Gyro => {
                        Sample::new(self.next_ms, 0.02 * phase.sin(), 0.02 * phase.cos(), 0.0)
                    }
                };
                sink(TaggedSample { channel, sample });
            }
            self.step = self.step.wrapping_add(1);
            self.next_ms += self.period_ms;
        }
    }
}
