use core::f32::consts::PI;

use log::debug;

use super::{
    config::ExtractorParams,
    types::{MetricKind, MetricSet, Sample, SensorChannel},
};

pub const MIN_SAMPLES: usize = 2;
pub const STEP_REGULARITY_SENTINEL: f32 = 5.0;

const RAD_TO_DEG: f32 = 180.0 / PI;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ShakeStats {
    pub count: u32,
    pub max_intensity: f32,
    pub mean_intensity: f32,
}

fn delta_magnitude(current: &Sample, prev: &Sample, planar: bool) -> f32 {
    let (dx, dy, dz) = current.delta(prev);
    if planar {
        (dx * dx + dy * dy).sqrt()
    } else {
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

pub fn magnitude_change_energy(samples: &[Sample], planar: bool) -> f32 {
    if samples.len() < MIN_SAMPLES {
        return 0.0;
    }
    let total: f32 = samples
        .windows(2)
        .map(|pair| delta_magnitude(&pair[1], &pair[0], planar))
        .sum();
    total / (samples.len() - 1) as f32
}

pub fn angular_tilt_accumulation(samples: &[Sample], sampling_rate_hz: f32) -> f32 {
    if samples.len() < MIN_SAMPLES || sampling_rate_hz <= 0.0 {
        return 0.0;
    }
    samples
        .iter()
        .map(|s| s.abs_sum() / sampling_rate_hz * RAD_TO_DEG)
        .sum()
}

pub fn vertical_peaks(samples: &[Sample], peak_threshold: f32) -> Vec<usize> {
    if samples.len() < 3 {
        return Vec::new();
    }
    (1..samples.len() - 1)
        .filter(|&i| {
            let z = samples[i].z;
            z > peak_threshold && z > samples[i - 1].z && z >= samples[i + 1].z
        })
        .collect()
}

// Coefficient of variation of the sample-index gaps between vertical peaks.
pub fn step_interval_regularity(samples: &[Sample], peak_threshold: f32) -> f32 {
    let peaks = vertical_peaks(samples, peak_threshold);
    if peaks.len() < 2 {
        return STEP_REGULARITY_SENTINEL;
    }

    let gaps: Vec<f32> = peaks.windows(2).map(|w| (w[1] - w[0]) as f32).collect();
    let mean = gaps.iter().sum::<f32>() / gaps.len() as f32;
    if mean <= 0.0 {
        return STEP_REGULARITY_SENTINEL;
    }
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f32>() / gaps.len() as f32;
    variance.sqrt() / mean
}

pub fn shake_events(samples: &[Sample], shake_threshold: f32) -> ShakeStats {
    if samples.len() < MIN_SAMPLES {
        return ShakeStats::default();
    }

    let mut stats = ShakeStats::default();
    let mut total = 0.0f32;
    for pair in samples.windows(2) {
        let intensity = delta_magnitude(&pair[1], &pair[0], false);
        if intensity > shake_threshold {
            stats.count += 1;
            total += intensity;
            if intensity > stats.max_intensity {
                stats.max_intensity = intensity;
            }
        }
    }
    if stats.count > 0 {
        stats.mean_intensity = total / stats.count as f32;
    }
    stats
}

// Runs only the extractors behind `wanted`. A metric whose source buffer holds
// fewer than two samples still gets its sentinel, and the whole set is marked
// insufficient.
pub fn compute_metrics(
    accel: &[Sample],
    gyro: &[Sample],
    wanted: impl IntoIterator<Item = MetricKind>,
    params: &ExtractorParams,
) -> MetricSet {
    let mut metrics = MetricSet::new();
    let mut shake: Option<ShakeStats> = None;

    for kind in wanted {
        let Some(channel) = kind.source_channel() else {
            continue;
        };
        let samples = match channel {
            SensorChannel::Accel => accel,
            SensorChannel::Gyro => gyro,
        };
        if samples.len() < MIN_SAMPLES {
            metrics.mark_insufficient();
        }

        let value = match kind {
            MetricKind::MagnitudeChangeEnergy => {
                magnitude_change_energy(samples, params.planar_energy)
            }
            MetricKind::AngularTiltAccumulation => {
                angular_tilt_accumulation(samples, params.sampling_rate_hz)
            }
            MetricKind::StepIntervalRegularity => {
                step_interval_regularity(samples, params.step_peak_threshold)
            }
            MetricKind::ShakeEventCount
            | MetricKind::ShakeMaxIntensity
            | MetricKind::ShakeMeanIntensity => {
                let stats = *shake
                    .get_or_insert_with(|| shake_events(samples, params.shake_threshold));
                match kind {
                    MetricKind::ShakeEventCount => stats.count as f32,
                    MetricKind::ShakeMaxIntensity => stats.max_intensity,
                    _ => stats.mean_intensity,
                }
            }
            _ => continue,
        };
        debug!("metric {}={value:.4}", kind.as_str());
        metrics.insert(kind, value);
    }

    metrics
}
