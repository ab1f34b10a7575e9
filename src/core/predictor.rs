//! Load prediction: windowed averages, hourly seasonality, and bottleneck
//! surfacing for the rebalancer.
//!
//! The predictor is deliberately cheap: moving averages, first differences,
//! and a 24-bucket hour-of-day profile. Task completion times are tracked
//! for analytical reporting only and never feed the forecast loop.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::task::ResourceKind;
use crate::util::clock::hour_of_day;

/// Utilization level above which a predicted load flags a bottleneck.
const BOTTLENECK_THRESHOLD: f64 = 0.8;

/// Completion-time level (seconds) above which a task series is an outlier.
const SLOW_TASK_SECS: f64 = 1.0;

/// Short-horizon utilization forecast for one resource kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadPrediction {
    /// Forecast utilization at the horizon.
    pub predicted_utilization: f64,
    /// `1 / (1 + stddev)` of the history: decreases with variance.
    pub confidence: f64,
    /// Wall-clock milliseconds the forecast was produced at.
    pub horizon_ms: u128,
    /// True when the forecast crosses the bottleneck threshold.
    pub bottleneck: bool,
}

/// Full per-kind prediction: forecast, trend, and seasonality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePrediction {
    /// Resource kind this prediction covers.
    pub kind: ResourceKind,
    /// The forecast itself.
    pub load: LoadPrediction,
    /// First differences of the recent history, oldest first.
    pub trend: Vec<f64>,
    /// Ratio of the current hour's mean to the cross-hour mean.
    pub seasonal_factor: f64,
}

/// Summary of one task's completion-time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStats {
    /// Task description the series is keyed on.
    pub description: String,
    /// Mean completion time in seconds.
    pub mean_secs: f64,
    /// Number of samples behind the mean.
    pub samples: usize,
    /// True when the mean exceeds the slow-task threshold.
    pub outlier: bool,
}

#[derive(Debug, Default)]
struct HourlyProfile {
    sums: [f64; 24],
    counts: [u32; 24],
    total_samples: usize,
}

impl HourlyProfile {
    fn record(&mut self, hour: usize, value: f64) {
        self.sums[hour] += value;
        self.counts[hour] += 1;
        self.total_samples += 1;
    }

    /// Mean at `hour` over the mean of non-empty buckets; 1.0 until a full
    /// day of samples exists or when the profile is flat at zero.
    fn factor(&self, hour: usize) -> f64 {
        if self.total_samples < 24 {
            return 1.0;
        }
        if self.counts[hour] == 0 {
            return 1.0;
        }
        let hour_mean = self.sums[hour] / f64::from(self.counts[hour]);
        let mut bucket_means = 0.0;
        let mut buckets = 0u32;
        for h in 0..24 {
            if self.counts[h] > 0 {
                bucket_means += self.sums[h] / f64::from(self.counts[h]);
                buckets += 1;
            }
        }
        if buckets == 0 {
            return 1.0;
        }
        let overall = bucket_means / f64::from(buckets);
        if overall <= f64::EPSILON {
            1.0
        } else {
            hour_mean / overall
        }
    }
}

/// Per-agent load predictor.
#[derive(Debug)]
pub struct LoadPredictor {
    max_history: usize,
    refresh_interval: Duration,
    last_refresh: Option<Instant>,
    history: HashMap<ResourceKind, VecDeque<f64>>,
    hourly: HashMap<ResourceKind, HourlyProfile>,
    predictions: HashMap<ResourceKind, ResourcePrediction>,
    completion_times: HashMap<String, VecDeque<f64>>,
}

impl LoadPredictor {
    /// Predictor with the given history cap and minimum refresh gap.
    #[must_use]
    pub fn new(max_history: usize, refresh_interval: Duration) -> Self {
        Self {
            max_history: max_history.max(1),
            refresh_interval,
            last_refresh: None,
            history: HashMap::new(),
            hourly: HashMap::new(),
            predictions: HashMap::new(),
            completion_times: HashMap::new(),
        }
    }

    /// Record one utilization sample for a kind. `epoch_ms` buckets the
    /// sample into its wall-clock hour.
    pub fn record_sample(&mut self, kind: ResourceKind, utilization: f64, epoch_ms: u128) {
        let series = self.history.entry(kind).or_default();
        if series.len() >= self.max_history {
            series.pop_front();
        }
        series.push_back(utilization);
        self.hourly
            .entry(kind)
            .or_default()
            .record(hour_of_day(epoch_ms), utilization);
    }

    /// Recompute predictions if the refresh interval has elapsed. Returns
    /// false when the call was gated.
    pub fn refresh(&mut self, now: Instant, epoch_ms: u128) -> bool {
        if let Some(last) = self.last_refresh {
            if now.duration_since(last) < self.refresh_interval {
                return false;
            }
        }
        self.last_refresh = Some(now);

        let hour = hour_of_day(epoch_ms);
        for (&kind, series) in &self.history {
            if series.is_empty() {
                continue;
            }
            let avg = mean(series.iter().copied());
            let seasonal = self.hourly.get(&kind).map_or(1.0, |p| p.factor(hour));
            let predicted = avg * seasonal;
            let confidence = 1.0 / (1.0 + stddev(series.iter().copied()));
            let trend: Vec<f64> = series
                .iter()
                .zip(series.iter().skip(1))
                .map(|(a, b)| b - a)
                .collect();

            self.predictions.insert(
                kind,
                ResourcePrediction {
                    kind,
                    load: LoadPrediction {
                        predicted_utilization: predicted,
                        confidence,
                        horizon_ms: epoch_ms,
                        bottleneck: predicted > BOTTLENECK_THRESHOLD,
                    },
                    trend,
                    seasonal_factor: seasonal,
                },
            );
            if predicted > BOTTLENECK_THRESHOLD {
                tracing::warn!(
                    kind = kind.as_str(),
                    predicted,
                    "resource predicted to be a bottleneck"
                );
            }
        }
        true
    }

    /// Latest prediction for a kind, if one was computed.
    #[must_use]
    pub fn prediction(&self, kind: ResourceKind) -> Option<&ResourcePrediction> {
        self.predictions.get(&kind)
    }

    /// Kinds whose latest forecast flags a bottleneck, sorted.
    #[must_use]
    pub fn bottlenecks(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self
            .predictions
            .values()
            .filter(|p| p.load.bottleneck)
            .map(|p| p.kind)
            .collect();
        kinds.sort();
        kinds
    }

    /// Most recent first difference of a kind's history, or 0.0.
    #[must_use]
    pub fn latest_trend(&self, kind: ResourceKind) -> f64 {
        self.predictions
            .get(&kind)
            .and_then(|p| p.trend.last().copied())
            .unwrap_or(0.0)
    }

    /// Least-squares slope over a kind's full history window.
    #[must_use]
    pub fn trend_slope(&self, kind: ResourceKind) -> f64 {
        self.history
            .get(&kind)
            .map_or(0.0, |series| regression_slope(series.iter().copied()))
    }

    /// Append a completion-time sample (seconds) to a task series.
    pub fn record_completion(&mut self, description: &str, secs: f64) {
        let series = self
            .completion_times
            .entry(description.to_owned())
            .or_default();
        if series.len() >= self.max_history {
            series.pop_front();
        }
        series.push_back(secs);
    }

    /// Analytical report over the completion-time series.
    #[must_use]
    pub fn completion_report(&self) -> Vec<CompletionStats> {
        let mut out: Vec<CompletionStats> = self
            .completion_times
            .iter()
            .map(|(description, series)| {
                let mean_secs = mean(series.iter().copied());
                CompletionStats {
                    description: description.clone(),
                    mean_secs,
                    samples: series.len(),
                    outlier: mean_secs > SLOW_TASK_SECS,
                }
            })
            .collect();
        out.sort_by(|a, b| a.description.cmp(&b.description));
        out
    }

    /// Human-readable advisories derived from utilization and completion
    /// history.
    #[must_use]
    pub fn recommendations(&self) -> Vec<String> {
        let mut recs = Vec::new();
        let mut kinds: Vec<&ResourceKind> = self.history.keys().collect();
        kinds.sort();
        for &kind in kinds {
            if let Some(series) = self.history.get(&kind) {
                if series.len() >= 24 && mean(series.iter().copied()) > BOTTLENECK_THRESHOLD {
                    recs.push(format!(
                        "consider increasing capacity for resource {}",
                        kind.as_str()
                    ));
                }
            }
        }
        for stats in self.completion_report() {
            if stats.samples >= 10 && stats.outlier {
                recs.push(format!(
                    "task '{}' is taking longer than expected",
                    stats.description
                ));
            }
        }
        recs
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        {
            sum / n as f64
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn stddev(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let m = mean(values.clone());
    let mut sq = 0.0;
    let mut n = 0usize;
    for v in values {
        sq += (v - m) * (v - m);
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        (sq / n as f64).sqrt()
    }
}

#[allow(clippy::cast_precision_loss)]
fn regression_slope(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    let mut n = 0usize;
    for (i, v) in values.enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += v;
        sum_xy += x * v;
        sum_xx += x * x;
        n += 1;
    }
    if n < 2 {
        return 0.0;
    }
    let n = n as f64;
    let denom = n.mul_add(sum_xx, -(sum_x * sum_x));
    if denom.abs() <= f64::EPSILON {
        0.0
    } else {
        n.mul_add(sum_xy, -(sum_x * sum_y)) / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: u128 = 3_600_000;

    #[test]
    fn test_seasonal_factor_is_one_below_a_day() {
        let mut p = LoadPredictor::new(64, Duration::ZERO);
        for i in 0..10 {
            p.record_sample(ResourceKind::GpuMemory, 0.5, i * HOUR_MS);
        }
        p.refresh(Instant::now(), 0);
        let pred = p.prediction(ResourceKind::GpuMemory).unwrap();
        assert!((pred.seasonal_factor - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prediction_is_average_times_seasonal() {
        let mut p = LoadPredictor::new(64, Duration::ZERO);
        // 30 samples of 0.85, all in the same hour bucket.
        for _ in 0..30 {
            p.record_sample(ResourceKind::GpuMemory, 0.85, 0);
        }
        p.refresh(Instant::now(), 0);
        let pred = p.prediction(ResourceKind::GpuMemory).unwrap();
        // Single populated bucket: factor 1.0, prediction = mean.
        assert!((pred.load.predicted_utilization - 0.85).abs() < 1e-9);
        assert!(pred.load.confidence > 0.5);
        assert!(pred.load.bottleneck);
    }

    #[test]
    fn test_confidence_decreases_with_variance() {
        let mut flat = LoadPredictor::new(64, Duration::ZERO);
        let mut noisy = LoadPredictor::new(64, Duration::ZERO);
        for i in 0..20 {
            flat.record_sample(ResourceKind::CpuCompute, 0.5, 0);
            let v = if i % 2 == 0 { 0.1 } else { 0.9 };
            noisy.record_sample(ResourceKind::CpuCompute, v, 0);
        }
        flat.refresh(Instant::now(), 0);
        noisy.refresh(Instant::now(), 0);

        let flat_conf = flat.prediction(ResourceKind::CpuCompute).unwrap().load.confidence;
        let noisy_conf = noisy
            .prediction(ResourceKind::CpuCompute)
            .unwrap()
            .load
            .confidence;
        assert!(flat_conf > noisy_conf);
        assert!((flat_conf - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_refresh_is_gated_by_interval() {
        let mut p = LoadPredictor::new(64, Duration::from_secs(30));
        p.record_sample(ResourceKind::GpuMemory, 0.2, 0);
        let t0 = Instant::now();
        assert!(p.refresh(t0, 0));
        assert!(!p.refresh(t0 + Duration::from_secs(1), 0));
        assert!(p.refresh(t0 + Duration::from_secs(31), 0));
    }

    #[test]
    fn test_trend_is_first_differences() {
        let mut p = LoadPredictor::new(64, Duration::ZERO);
        for (i, v) in [0.1, 0.3, 0.2].iter().enumerate() {
            p.record_sample(ResourceKind::StorageIo, *v, i as u128);
        }
        p.refresh(Instant::now(), 0);
        let pred = p.prediction(ResourceKind::StorageIo).unwrap();
        assert_eq!(pred.trend.len(), 2);
        assert!((pred.trend[0] - 0.2).abs() < 1e-12);
        assert!((pred.trend[1] + 0.1).abs() < 1e-12);
        assert!((p.latest_trend(ResourceKind::StorageIo) + 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut p = LoadPredictor::new(8, Duration::ZERO);
        for i in 0..100 {
            p.record_sample(ResourceKind::CpuMemory, 0.5, i);
        }
        p.refresh(Instant::now(), 0);
        // Trend has history-1 entries, so the window cap held.
        assert_eq!(p.prediction(ResourceKind::CpuMemory).unwrap().trend.len(), 7);
    }

    #[test]
    fn test_completion_report_flags_outliers() {
        let mut p = LoadPredictor::new(64, Duration::ZERO);
        for _ in 0..12 {
            p.record_completion("slow inference", 2.5);
            p.record_completion("fast lookup", 0.05);
        }
        let report = p.completion_report();
        let slow = report.iter().find(|s| s.description == "slow inference").unwrap();
        let fast = report.iter().find(|s| s.description == "fast lookup").unwrap();
        assert!(slow.outlier);
        assert!(!fast.outlier);

        let recs = p.recommendations();
        assert!(recs.iter().any(|r| r.contains("slow inference")));
    }

    #[test]
    fn test_seasonal_factor_with_full_day() {
        let mut p = LoadPredictor::new(256, Duration::ZERO);
        // One sample per hour: 0.9 at hour 0, 0.1 everywhere else.
        for h in 0u128..24 {
            let v = if h == 0 { 0.9 } else { 0.1 };
            p.record_sample(ResourceKind::GpuCompute, v, h * HOUR_MS);
        }
        p.refresh(Instant::now(), 0);
        let pred = p.prediction(ResourceKind::GpuCompute).unwrap();
        // Hour 0 mean (0.9) over cross-bucket mean ((0.9 + 23*0.1)/24).
        let overall = (0.9 + 23.0 * 0.1) / 24.0;
        assert!((pred.seasonal_factor - 0.9 / overall).abs() < 1e-9);
    }
}
