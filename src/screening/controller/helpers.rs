use log::{info, warn};

use super::{ControllerAction, ControllerOutcome, DispatchContext, TestHsm};
use crate::screening::{
    buffer::SampleBuffer,
    classifier::classify,
    config::{FallbackPolicy, TestKind, TestProfile},
    features::compute_metrics,
    sensor::{SampleQueue, SensorError, SensorProvider, SyntheticSampleGenerator},
    sequence::SequenceTracker,
    types::{
        ControllerStateId, DataSource, MetricKind, MetricSet, SensorChannel, TestResult, Verdict,
        VerdictReason, INSUFFICIENT_DATA_NOTE,
    },
};

impl TestHsm {
    pub(super) fn new(
        profile: TestProfile,
        difficulty: Option<u8>,
        provider: Box<dyn SensorProvider>,
    ) -> Self {
        Self {
            profile,
            difficulty,
            provider,
            queue: SampleQueue::new(),
            subscriptions: heapless::Vec::new(),
            accel: SampleBuffer::new(SensorChannel::Accel),
            gyro: SampleBuffer::new(SensorChannel::Gyro),
            data_source: DataSource::Sensor,
            synthetic: None,
            sequence: None,
            external: None,
            countdown_deadline_ms: 0,
            countdown_reported_s: u8::MAX,
            capture_deadline_ms: 0,
            state_id: ControllerStateId::Idle,
            result: None,
            last_trace: Default::default(),
        }
    }

    pub(super) fn arm(&mut self, now_ms: u64) {
        self.teardown();
        self.discard_capture();
        self.result = None;
        self.data_source = match self.profile.kind {
            TestKind::External => DataSource::External,
            TestKind::Motion | TestKind::Sequence => DataSource::Sensor,
        };
        self.sequence = match self.profile.kind {
            TestKind::Sequence => self.profile.sequence.as_ref().map(SequenceTracker::new),
            _ => None,
        };
        self.countdown_deadline_ms = now_ms.saturating_add(self.profile.countdown_ms);
        self.countdown_reported_s = u8::MAX;
        self.state_id = ControllerStateId::Countdown;
    }

    pub(super) fn remaining_seconds(deadline_ms: u64, now_ms: u64) -> u8 {
        let remaining_ms = deadline_ms.saturating_sub(now_ms);
        remaining_ms.div_ceil(1_000).min(u64::from(u8::MAX)) as u8
    }

    pub(super) fn report_countdown(&mut self, context: &mut DispatchContext, now_ms: u64) {
        let remaining_s = Self::remaining_seconds(self.countdown_deadline_ms, now_ms);
        if remaining_s != self.countdown_reported_s {
            self.countdown_reported_s = remaining_s;
            context.push(ControllerAction::CountdownTick { remaining_s });
        }
    }

    // Returns false when the capture window could not be opened and the
    // fail-safe result has already been recorded.
    pub(super) fn open_capture(&mut self, context: &mut DispatchContext, now_ms: u64) -> bool {
        self.state_id = ControllerStateId::Capturing;
        self.capture_deadline_ms = now_ms.saturating_add(self.profile.effective_capture_ms());

        match self.profile.kind {
            TestKind::Motion => {
                if let Err(err) = self.subscribe_all() {
                    warn!("{}: sensor subscribe failed: {err}", self.profile.name);
                    self.teardown();
                    match self.profile.fallback {
                        FallbackPolicy::Simulate => {
                            warn!("{}: continuing with simulated samples", self.profile.name);
                            self.data_source = DataSource::Simulated;
                            self.synthetic = Some(SyntheticSampleGenerator::new(
                                self.profile.extractor.sampling_rate_hz,
                                now_ms,
                            ));
                        }
                        FallbackPolicy::FailSafe => {
                            self.data_source = DataSource::Unavailable;
                            self.record_result(
                                context,
                                now_ms,
                                Verdict::fail_safe(VerdictReason::InsufficientData),
                                MetricSet::insufficient(),
                            );
                            return false;
                        }
                    }
                }
            }
            TestKind::Sequence => {
                if let Some(sequence) = self.sequence.as_mut() {
                    sequence.begin(now_ms);
                }
            }
            TestKind::External => {}
        }

        info!(
            "{}: capture started ({}) until {}ms",
            self.profile.name,
            self.data_source.as_str(),
            self.capture_deadline_ms
        );
        context.push(ControllerAction::CaptureStarted {
            data_source: self.data_source,
        });
        true
    }

    fn subscribe_all(&mut self) -> Result<(), SensorError> {
        for &channel in &self.profile.channels {
            if self.subscriptions.iter().any(|h| h.channel == channel) {
                continue;
            }
            let handle = self
                .provider
                .subscribe(channel, self.queue.sender(channel))?;
            if let Err(handle) = self.subscriptions.push(handle) {
                self.provider.unsubscribe(handle);
                return Err(SensorError::Busy);
            }
        }
        Ok(())
    }

    // Moves queued and synthetic samples into the buffers and closes overdue
    // sequence steps. Returns true once the capture window is over.
    pub(super) fn advance_capture(&mut self, context: &mut DispatchContext, now_ms: u64) -> bool {
        self.drain_queue();

        if let Some(generator) = self.synthetic.as_mut() {
            let accel = &mut self.accel;
            let gyro = &mut self.gyro;
            generator.fill(
                now_ms.min(self.capture_deadline_ms),
                &self.profile.channels,
                |tagged| {
                    match tagged.channel {
                        SensorChannel::Accel => accel.append(tagged.sample),
                        SensorChannel::Gyro => gyro.append(tagged.sample),
                    };
                },
            );
        }

        if let Some(sequence) = self.sequence.as_mut() {
            while let Some(record) = sequence.poll(now_ms) {
                context.push(ControllerAction::StepAdvanced {
                    index: record.index,
                    direction: record.direction,
                    matched: record.matched,
                });
            }
            if sequence.is_finished() {
                return true;
            }
        }

        now_ms >= self.capture_deadline_ms
    }

    fn drain_queue(&mut self) {
        while let Some(tagged) = self.queue.try_receive() {
            self.sample_buffer(tagged.channel).append(tagged.sample);
        }
    }

    pub(super) fn close_capture(&mut self, context: &mut DispatchContext, now_ms: u64) {
        self.state_id = ControllerStateId::Analyzing;
        self.drain_queue();
        self.teardown();

        let (verdict, metrics) = self.analyze();
        self.record_result(context, now_ms, verdict, metrics);
        self.discard_capture();
    }

    fn analyze(&mut self) -> (Verdict, MetricSet) {
        let table = self.profile.threshold_table(self.difficulty);
        match self.profile.kind {
            TestKind::Motion => {
                let metrics = compute_metrics(
                    self.accel.snapshot(),
                    self.gyro.snapshot(),
                    table.metrics(),
                    &self.profile.extractor,
                );
                (classify(&metrics, table), metrics)
            }
            TestKind::Sequence => {
                let Some(sequence) = self.sequence.as_ref() else {
                    return (
                        Verdict::fail_safe(VerdictReason::InsufficientData),
                        MetricSet::insufficient(),
                    );
                };
                let metrics = sequence.metrics();
                let mut verdict = classify(&metrics, table);
                if sequence.early_exit() && !metrics.is_insufficient() {
                    verdict.is_abnormal = true;
                    verdict.reason = VerdictReason::EarlyExit;
                }
                (verdict, metrics)
            }
            TestKind::External => {
                let Some((score, flagged)) = self.external else {
                    self.data_source = DataSource::Unavailable;
                    return (
                        Verdict::fail_safe(VerdictReason::InsufficientData),
                        MetricSet::insufficient(),
                    );
                };
                let metrics = MetricSet::new().with(MetricKind::ExternalScore, score);
                let mut verdict = classify(&metrics, table);
                if flagged && !verdict.is_abnormal {
                    verdict.is_abnormal = true;
                    verdict.reason = VerdictReason::External;
                }
                (verdict, metrics)
            }
        }
    }

    fn record_result(
        &mut self,
        context: &mut DispatchContext,
        now_ms: u64,
        verdict: Verdict,
        metrics: MetricSet,
    ) {
        let annotation = metrics.is_insufficient().then_some(INSUFFICIENT_DATA_NOTE);
        let result = TestResult {
            test_name: self.profile.name.clone(),
            verdict,
            completed_at_ms: now_ms,
            data_source: self.data_source,
            metrics,
            annotation,
        };
        info!(
            "{}: result score={:.3} abnormal={} reason={} source={}",
            result.test_name,
            result.verdict.score,
            result.verdict.is_abnormal,
            result.verdict.reason.label(),
            result.data_source.as_str()
        );
        self.state_id = ControllerStateId::Result;
        context.finish(ControllerOutcome::Completed(result.clone()));
        self.result = Some(result);
    }

    pub(super) fn teardown(&mut self) {
        while let Some(handle) = self.subscriptions.pop() {
            self.provider.unsubscribe(handle);
        }
    }

    pub(super) fn discard_capture(&mut self) {
        self.queue.clear();
        self.accel = SampleBuffer::new(SensorChannel::Accel);
        self.gyro = SampleBuffer::new(SensorChannel::Gyro);
        self.synthetic = None;
        self.external = None;
    }
}
