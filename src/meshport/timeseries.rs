use std::{
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

/// Width of one aggregation bucket.
pub const BUCKET: Duration = Duration::from_secs(1);

/// How many buckets a route retains (~16 minutes at 1 s buckets).
pub const MAX_POINTS: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Throughput {
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataPoint {
    /// Unix seconds, truncated to the bucket width.
    pub timestamp: u64,
    pub value: Throughput,
}

/// Bounded ring of per-bucket byte counters for one route.
///
/// Counts logged within the same bucket merge into one point; once the buffer
/// is full the oldest point is dropped, and its bytes leave `total()` with it
/// (sliding-window totals).
#[derive(Debug)]
pub struct TimeSeries {
    points: Mutex<Vec<DataPoint>>,
    bucket_secs: u64,
    max_size: usize,
}

impl TimeSeries {
    pub fn new(bucket: Duration, max_size: usize) -> Self {
        Self {
            points: Mutex::new(Vec::new()),
            bucket_secs: bucket.as_secs().max(1),
            max_size,
        }
    }

    pub fn log_sent(&self, value: u64) {
        self.record(self.current_bucket(), value, 0);
    }

    pub fn log_received(&self, value: u64) {
        self.record(self.current_bucket(), 0, value);
    }

    /// Sum across surviving points.
    pub fn total(&self) -> Throughput {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Throughput::default();
        for p in points.iter() {
            out.sent += p.value.sent;
            out.received += p.value.received;
        }
        out
    }

    /// Ordered snapshot of the buffer.
    pub fn points(&self) -> Vec<DataPoint> {
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn current_bucket(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now - now % self.bucket_secs
    }

    fn record(&self, bucket: u64, sent: u64, received: u64) {
        if sent == 0 && received == 0 {
            return;
        }
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        match points.last_mut() {
            Some(last) if last.timestamp == bucket => {
                last.value.sent += sent;
                last.value.received += received;
            }
            _ => {
                points.push(DataPoint {
                    timestamp: bucket,
                    value: Throughput { sent, received },
                });
            }
        }
        if points.len() > self.max_size {
            points.remove(0);
        }
    }
}

impl Default for TimeSeries {
    fn default() -> Self {
        Self::new(BUCKET, MAX_POINTS)
    }
}
