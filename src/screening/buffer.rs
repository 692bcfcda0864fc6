use log::warn;

use super::types::{Sample, SensorChannel};

#[derive(Clone, Debug)]
pub struct SampleBuffer {
    channel: SensorChannel,
    samples: Vec<Sample>,
    dropped_out_of_order: u32,
}

impl SampleBuffer {
    pub fn new(channel: SensorChannel) -> Self {
        Self {
            channel,
            samples: Vec::new(),
            dropped_out_of_order: 0,
        }
    }

    pub fn channel(&self) -> SensorChannel {
        self.channel
    }

    // Returns false when the sample was dropped for arriving with a timestamp
    // earlier than the last accepted one. Equal timestamps are accepted.
    pub fn append(&mut self, sample: Sample) -> bool {
        if let Some(last) = self.samples.last() {
            if sample.timestamp_ms < last.timestamp_ms {
                self.dropped_out_of_order = self.dropped_out_of_order.saturating_add(1);
                warn!(
                    "{} sample dropped: timestamp {}ms precedes {}ms",
                    self.channel.as_str(),
                    sample.timestamp_ms,
                    last.timestamp_ms
                );
                return false;
            }
        }
        self.samples.push(sample);
        true
    }

    pub fn snapshot(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn dropped_out_of_order(&self) -> u32 {
        self.dropped_out_of_order
    }

    pub fn last_timestamp_ms(&self) -> Option<u64> {
        self.samples.last().map(|s| s.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_sample_is_dropped_and_counted() {
        let mut buffer = SampleBuffer::new(SensorChannel::Accel);
        assert!(buffer.append(Sample::new(100, 0.0, 0.0, 9.8)));
        assert!(buffer.append(Sample::new(120, 0.1, 0.0, 9.8)));
        assert!(!buffer.append(Sample::new(110, 5.0, 5.0, 5.0)));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped_out_of_order(), 1);
        assert_eq!(buffer.last_timestamp_ms(), Some(120));
    }

    #[test]
    fn equal_timestamps_are_kept_in_arrival_order() {
        let mut buffer = SampleBuffer::new(SensorChannel::Gyro);
        assert!(buffer.append(Sample::new(50, 1.0, 0.0, 0.0)));
        assert!(buffer.append(Sample::new(50, 2.0, 0.0, 0.0)));

        let xs: Vec<f32> = buffer.snapshot().iter().map(|s| s.x).collect();
        assert_eq!(xs, vec![1.0, 2.0]);
    }

    #[test]
    fn snapshot_does_not_consume_samples() {
        let mut buffer = SampleBuffer::new(SensorChannel::Accel);
        buffer.append(Sample::new(1, 0.0, 0.0, 0.0));
        let first = buffer.snapshot().len();
        let second = buffer.snapshot().len();
        assert_eq!(first, second);
        assert!(!buffer.is_empty());
    }
}
