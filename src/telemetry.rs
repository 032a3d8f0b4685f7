/// Telemetry events sent from the dispatch engine to the progress tracker
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// The engine resolved its batch window
    BatchStarted { start: usize, end: usize },
    /// A message was delivered to the channel
    Sent { index: usize, duration_ms: u64 },
    /// A send attempt failed (terminal for this identity)
    Failed { index: usize, duration_ms: u64 },
    /// Recipient was already attempted in an earlier run and was skipped
    Duplicate { index: usize },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub window_size: usize,
    pub processed: usize,
    pub sent: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub send_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::BatchStarted { start, end } => {
                self.window_size = end.saturating_sub(*start);
            }
            TelemetryEvent::Sent { duration_ms, .. } => {
                self.processed += 1;
                self.sent += 1;
                self.send_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::Failed { duration_ms, .. } => {
                self.processed += 1;
                self.failed += 1;
                self.send_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::Duplicate { .. } => {
                self.processed += 1;
                self.duplicates += 1;
            }
        }
    }

    /// Calculate percentile from send durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.send_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.send_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50 and p90 send latency
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>) {
        (self.percentile(50.0), self.percentile(90.0))
    }
}
