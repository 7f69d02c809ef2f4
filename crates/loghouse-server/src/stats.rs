//! Request-stats aggregator
//!
//! A single owner task holds the route → samples map; the request layer
//! only ever sends observations down a bounded channel, so no lock guards
//! the map. Two triggers flush it: the periodic timer tick, and any
//! route's sample reaching [`STATS_LIMIT`], which flushes everything
//! immediately to keep memory bounded under load.
//!
//! A flush computes per-route summaries (count, sum, min, max, mean,
//! sample standard deviation, and a fixed-bucket histogram for service
//! time and request/response sizes) and emits them as structured tracing
//! records. Routes with zero samples are skipped.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::HttpBody;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::AppState;

/// Per-route sample cap; reaching it forces an immediate flush.
pub const STATS_LIMIT: usize = 10_000;

/// How often accumulated stats are flushed regardless of volume.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

const DURATION_MS_BINS: &[f64] = &[
    0.0, 250.0, 500.0, 1000.0, 5000.0, 30_000.0, 60_000.0, 300_000.0,
];
const SIZE_MB_BINS: &[f64] = &[0.0, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0];

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One request's worth of observations, sent by the middleware.
#[derive(Debug, Clone, Default)]
pub struct RouteResponse {
    pub route: String,
    pub duration: Duration,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub status: u16,
}

#[derive(Debug, Default)]
struct RouteStats {
    duration_ms: Vec<f64>,
    request_mb: Vec<f64>,
    response_mb: Vec<f64>,
    status_counts: HashMap<u16, usize>,
}

/// Summary statistics over one sample dimension.
#[derive(Debug, Clone, Serialize)]
pub struct SliceSummary {
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub histogram: Vec<u64>,
}

/// The flushed record for one route.
#[derive(Debug, Serialize)]
pub struct RouteSummary {
    pub route: String,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_time_ms: Option<SliceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_size_mb: Option<SliceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size_mb: Option<SliceSummary>,
    pub statuses: HashMap<u16, usize>,
}

/// Single-writer aggregator; owned by the task running [`run`].
///
/// [`run`]: StatsLogger::run
pub struct StatsLogger {
    rx: mpsc::Receiver<RouteResponse>,
    stats_by_route: HashMap<String, RouteStats>,
    cache_is_full: bool,
    last_reset: Instant,
}

impl StatsLogger {
    /// Create the aggregator and the sender handed to the middleware.
    pub fn new(channel_capacity: usize) -> (mpsc::Sender<RouteResponse>, Self) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        (
            tx,
            Self {
                rx,
                stats_by_route: HashMap::new(),
                cache_is_full: false,
                last_reset: Instant::now(),
            },
        )
    }

    /// Drive the aggregator until every sender is dropped. A final flush
    /// runs on shutdown so buffered samples are not lost.
    pub async fn run(mut self, flush_interval: Duration) {
        let mut ticker = time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; consume it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.emit();
                }
                observation = self.rx.recv() => match observation {
                    Some(observation) => {
                        self.record_response(observation);
                        if self.cache_is_full {
                            self.emit();
                        }
                    }
                    None => {
                        self.emit();
                        return;
                    }
                },
            }
        }
    }

    fn record_response(&mut self, observation: RouteResponse) {
        let stats = self.stats_by_route.entry(observation.route).or_default();

        stats
            .duration_ms
            .push(observation.duration.as_secs_f64() * 1000.0);
        stats
            .request_mb
            .push(observation.request_bytes as f64 / BYTES_PER_MB);
        stats
            .response_mb
            .push(observation.response_bytes as f64 / BYTES_PER_MB);
        *stats.status_counts.entry(observation.status).or_default() += 1;

        if stats.duration_ms.len() >= STATS_LIMIT {
            self.cache_is_full = true;
        }
    }

    /// Summarize and clear every route's samples. Routes that saw no
    /// requests since the last flush produce nothing.
    fn flush_stats(&mut self) -> Vec<RouteSummary> {
        let mut summaries = Vec::new();

        for (route, stats) in self.stats_by_route.iter_mut() {
            if stats.duration_ms.is_empty() {
                continue;
            }

            summaries.push(RouteSummary {
                route: route.clone(),
                count: stats.duration_ms.len(),
                service_time_ms: slice_stats(&stats.duration_ms, DURATION_MS_BINS),
                request_size_mb: slice_stats(&stats.request_mb, SIZE_MB_BINS),
                response_size_mb: slice_stats(&stats.response_mb, SIZE_MB_BINS),
                statuses: std::mem::take(&mut stats.status_counts),
            });

            stats.duration_ms.clear();
            stats.request_mb.clear();
            stats.response_mb.clear();
        }

        self.cache_is_full = false;
        self.last_reset = Instant::now();
        summaries
    }

    fn emit(&mut self) {
        let window_secs = self.last_reset.elapsed().as_secs_f64();
        for summary in self.flush_stats() {
            let payload = serde_json::to_string(&summary).unwrap_or_default();
            tracing::info!(
                target: "route_stats",
                route = %summary.route,
                count = summary.count,
                window_secs,
                stats = %payload,
                "route response statistics"
            );
        }
    }
}

/// Compute summary statistics for one sample against histogram `bins`.
///
/// Returns `None` for an empty sample or when any value falls outside
/// `[bins[0], bins[last])`: a mis-sized histogram is reported as nothing
/// rather than as something misleading.
fn slice_stats(sample: &[f64], bins: &[f64]) -> Option<SliceSummary> {
    if sample.is_empty() || bins.len() < 2 {
        return None;
    }

    let mut histogram = vec![0u64; bins.len() - 1];
    for &value in sample {
        let bucket = bins.windows(2).position(|w| value >= w[0] && value < w[1])?;
        histogram[bucket] += 1;
    }

    let count = sample.len() as f64;
    let sum: f64 = sample.iter().sum();
    let min = sample.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = sample.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = sum / count;
    let std_dev = if sample.len() > 1 {
        let variance: f64 =
            sample.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (count - 1.0);
        variance.sqrt()
    } else {
        0.0
    };

    Some(SliceSummary {
        sum,
        min,
        max,
        mean,
        std_dev,
        histogram,
    })
}

/// Axum middleware: time the request, measure sizes, and send one
/// observation to the aggregator. `try_send` so a saturated channel drops
/// the observation instead of stalling the request.
pub async fn record_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let route = format!("{} {}", req.method(), route);
    let request_bytes = req.body().size_hint().exact().unwrap_or(0);

    let start = std::time::Instant::now();
    let response = next.run(req).await;

    let observation = RouteResponse {
        route,
        duration: start.elapsed(),
        request_bytes,
        response_bytes: response.body().size_hint().exact().unwrap_or(0),
        status: response.status().as_u16(),
    };
    let _ = state.stats.try_send(observation);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(route: &str, ms: u64) -> RouteResponse {
        RouteResponse {
            route: route.to_string(),
            duration: Duration::from_millis(ms),
            request_bytes: 1024,
            response_bytes: 2048,
            status: 200,
        }
    }

    #[test]
    fn test_slice_stats_valid_input() {
        let sample = [0.0, 5.0, 10.0];
        let bins = [0.0, 1.0, 5.0, 10.0, 20.0];

        let stats = slice_stats(&sample, &bins).unwrap();
        assert_eq!(stats.sum, 15.0);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 10.0);
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.std_dev, 5.0);
        assert_eq!(stats.histogram, vec![1, 0, 1, 1]);
    }

    #[test]
    fn test_slice_stats_empty_sample() {
        assert!(slice_stats(&[], &[0.0, 1.0, 5.0]).is_none());
    }

    #[test]
    fn test_slice_stats_value_outside_bins() {
        // 10 is not inside [5, 10), so the histogram cannot place it.
        let sample = [0.0, 5.0, 10.0];
        let bins = [0.0, 1.0, 5.0, 10.0];
        assert!(slice_stats(&sample, &bins).is_none());
    }

    #[test]
    fn test_slice_stats_out_of_order_sample() {
        let sample = [10.0, 5.0, 0.0];
        let bins = [0.0, 1.0, 5.0, 10.0, 20.0];

        let stats = slice_stats(&sample, &bins).unwrap();
        assert_eq!(stats.sum, 15.0);
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.std_dev, 5.0);
        assert_eq!(stats.histogram, vec![1, 0, 1, 1]);
    }

    #[test]
    fn test_record_response_fills_cache() {
        let (_tx, mut logger) = StatsLogger::new(8);
        for _ in 0..STATS_LIMIT {
            logger.record_response(observation("r0", 1));
        }

        assert_eq!(logger.stats_by_route.len(), 1);
        assert_eq!(logger.stats_by_route["r0"].duration_ms.len(), STATS_LIMIT);
        assert!(logger.cache_is_full);
    }

    // Feeding STATS_LIMIT + 1 observations forces a flush reporting
    // exactly STATS_LIMIT samples, never more.
    #[test]
    fn test_capacity_flush_reports_exactly_the_limit() {
        let (_tx, mut logger) = StatsLogger::new(8);

        for _ in 0..STATS_LIMIT {
            logger.record_response(observation("r0", 1));
        }
        assert!(logger.cache_is_full);

        let summaries = logger.flush_stats();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].count, STATS_LIMIT);
        assert!(!logger.cache_is_full);

        // The overflow observation lands in the fresh cache.
        logger.record_response(observation("r0", 1));
        assert_eq!(logger.stats_by_route["r0"].duration_ms.len(), 1);
    }

    #[test]
    fn test_flush_skips_empty_routes_and_clears() {
        let (_tx, mut logger) = StatsLogger::new(8);
        logger.record_response(observation("busy", 3));
        logger.record_response(observation("busy", 7));
        // "idle" has an entry with no samples after its own flush.
        logger.record_response(observation("idle", 1));
        logger.flush_stats();
        logger.record_response(observation("busy", 5));

        let summaries = logger.flush_stats();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].route, "busy");
        assert_eq!(summaries[0].count, 1);

        // Cleared, not removed.
        assert!(logger.stats_by_route.contains_key("busy"));
        assert!(logger.stats_by_route.contains_key("idle"));
        assert!(logger.stats_by_route["busy"].duration_ms.is_empty());
        assert!(logger.stats_by_route["busy"].status_counts.is_empty());
    }

    #[test]
    fn test_flush_summarizes_all_dimensions() {
        let (_tx, mut logger) = StatsLogger::new(8);
        for ms in [100, 200, 300] {
            logger.record_response(observation("r0", ms));
        }

        let summaries = logger.flush_stats();
        let summary = &summaries[0];
        assert_eq!(summary.count, 3);
        assert_eq!(summary.statuses[&200], 3);

        let service = summary.service_time_ms.as_ref().unwrap();
        assert_eq!(service.sum, 600.0);
        assert_eq!(service.min, 100.0);
        assert_eq!(service.max, 300.0);

        let request = summary.request_size_mb.as_ref().unwrap();
        assert!((request.sum - 3.0 * 1024.0 / BYTES_PER_MB).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_run_drains_and_exits_when_senders_drop() {
        let (tx, logger) = StatsLogger::new(8);
        let handle = tokio::spawn(logger.run(Duration::from_secs(3600)));

        for _ in 0..3 {
            tx.send(observation("r0", 1)).await.unwrap();
        }
        drop(tx);

        handle.await.unwrap();
    }
}
