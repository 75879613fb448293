//! Sliding-window event counter for outbound message rate limiting.

/// Counts events inside a sliding time window so the engine can stay under
/// the gate's message flooding limit.
///
/// Timestamps are monotonic nanoseconds. Events older than `period` are
/// forgotten lazily on the next call; eviction is O(evicted), so each add
/// is amortized O(1).
///
/// Not thread-safe. The quoting engine owns the only instance and touches
/// it exclusively from its executor task.
#[derive(Debug)]
pub struct FloodTracker {
    timestamps: Vec<u64>,
    oldest: usize,
    count: usize,
    period: u64,
}

impl FloodTracker {
    /// Creates a tracker allowing at most `capacity` events per `period`
    /// nanoseconds. A capacity of zero refuses every event.
    pub fn new(capacity: usize, period: u64) -> Self {
        Self {
            timestamps: vec![0; capacity],
            oldest: 0,
            count: 0,
            period,
        }
    }

    /// Number of further events permitted at time `now`.
    ///
    /// Events recorded before the window ending at `now` are forgotten, so
    /// this is not safe to call with future timestamps.
    pub fn available(&mut self, now: u64) -> usize {
        self.advance(now);
        self.timestamps.len() - self.count
    }

    /// Records an event at `now` if the window has room.
    ///
    /// Returns `true` if the event was recorded, `false` if recording it
    /// would exceed the limit (state is left unchanged in that case).
    /// Timestamps must be added in chronological order or expired events
    /// may linger in the count.
    pub fn add(&mut self, now: u64) -> bool {
        self.advance(now);
        if self.count < self.timestamps.len() {
            let slot = (self.oldest + self.count) % self.timestamps.len();
            self.timestamps[slot] = now;
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Forgets events with timestamps `< now - period`.
    fn advance(&mut self, now: u64) {
        let horizon = now.saturating_sub(self.period);
        while self.count > 0 && self.timestamps[self.oldest] < horizon {
            self.oldest = (self.oldest + 1) % self.timestamps.len();
            self.count -= 1;
        }
    }
}
