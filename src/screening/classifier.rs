use super::{
    config::ThresholdTable,
    types::{MetricKind, MetricSet, Verdict, VerdictReason},
};

// Weighted composite over the table's terms, OR'ed with each term's own
// limit. Anything that cannot be scored falls back to an abnormal verdict
// with a zero score.
pub fn classify(metrics: &MetricSet, table: &ThresholdTable) -> Verdict {
    if metrics.is_insufficient() {
        return Verdict::fail_safe(VerdictReason::InsufficientData);
    }
    if metrics.is_empty() || table.terms.is_empty() {
        return Verdict::fail_safe(VerdictReason::MalformedMetrics);
    }

    let mut score = 0.0f32;
    let mut breached: Option<MetricKind> = None;
    for term in &table.terms {
        let Some(value) = metrics.get(term.metric).filter(|v| v.is_finite()) else {
            return Verdict::fail_safe(VerdictReason::MalformedMetrics);
        };
        score += term.weight * value;
        if breached.is_none() && term.limit.is_some_and(|limit| value > limit) {
            breached = Some(term.metric);
        }
    }

    let reason = if score > table.score_threshold {
        VerdictReason::ScoreAboveThreshold
    } else if let Some(metric) = breached {
        VerdictReason::MetricLimit(metric)
    } else {
        VerdictReason::Normal
    };

    Verdict {
        score,
        is_abnormal: !matches!(reason, VerdictReason::Normal),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::super::config::MetricTerm;
    use super::*;

    fn balance_table() -> ThresholdTable {
        ThresholdTable {
            score_threshold: 10.0,
            terms: vec![
                MetricTerm {
                    metric: MetricKind::MagnitudeChangeEnergy,
                    weight: 0.6,
                    limit: Some(4.0),
                },
                MetricTerm {
                    metric: MetricKind::AngularTiltAccumulation,
                    weight: 0.4,
                    limit: None,
                },
            ],
        }
    }

    fn metrics(energy: f32, tilt: f32) -> MetricSet {
        MetricSet::new()
            .with(MetricKind::MagnitudeChangeEnergy, energy)
            .with(MetricKind::AngularTiltAccumulation, tilt)
    }

    #[test]
    fn weighted_score_below_threshold_is_normal() {
        let verdict = classify(&metrics(1.0, 5.0), &balance_table());
        assert!(!verdict.is_abnormal);
        assert_eq!(verdict.reason, VerdictReason::Normal);
        assert!((verdict.score - 2.6).abs() < 1e-5);
    }

    #[test]
    fn weighted_score_above_threshold_is_abnormal() {
        let verdict = classify(&metrics(2.0, 30.0), &balance_table());
        assert!(verdict.is_abnormal);
        assert_eq!(verdict.reason, VerdictReason::ScoreAboveThreshold);
    }

    #[test]
    fn single_metric_limit_is_sufficient_on_its_own() {
        let verdict = classify(&metrics(4.5, 0.0), &balance_table());
        assert!(verdict.score <= 10.0);
        assert!(verdict.is_abnormal);
        assert_eq!(
            verdict.reason,
            VerdictReason::MetricLimit(MetricKind::MagnitudeChangeEnergy)
        );
    }

    #[test]
    fn insufficient_metrics_fail_toward_caution() {
        let mut set = metrics(0.0, 0.0);
        set.mark_insufficient();
        let verdict = classify(&set, &balance_table());
        assert_eq!(
            verdict,
            Verdict::fail_safe(VerdictReason::InsufficientData)
        );
    }

    #[test]
    fn empty_or_incomplete_metrics_are_malformed() {
        let table = balance_table();
        for set in [
            MetricSet::new(),
            MetricSet::new().with(MetricKind::MagnitudeChangeEnergy, 1.0),
            metrics(f32::NAN, 1.0),
        ] {
            let verdict = classify(&set, &table);
            assert!(verdict.is_abnormal);
            assert_eq!(verdict.score, 0.0);
            assert_eq!(verdict.reason, VerdictReason::MalformedMetrics);
        }
    }

    #[test]
    fn classification_is_repeatable() {
        let set = metrics(3.3, 12.5);
        let table = balance_table();
        assert_eq!(classify(&set, &table), classify(&set, &table));
    }
}
