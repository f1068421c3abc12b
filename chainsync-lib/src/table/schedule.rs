use std::time::{Duration, Instant};

/// Tuning for proactive rechecks of the dataplane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecheckOptions {
    /// Reload when the cached view is older than this. Zero disables periodic refresh.
    pub refresh_interval: Duration,
    /// First recheck after a write.
    pub initial_post_write_interval: Duration,
    /// Once the post-write interval grows beyond this, post-write rechecks stop.
    pub post_write_cutoff: Duration,
}

impl Default for RecheckOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::ZERO,
            initial_post_write_interval: Duration::from_millis(50),
            post_write_cutoff: Duration::from_secs(3600),
        }
    }
}

/// Decayed peak of observed command durations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeakDuration(Duration);

impl PeakDuration {
    pub fn record(&mut self, measured: Duration) {
        let decayed = self.0 * 99 / 100;
        self.0 = decayed.max(measured);
    }

    pub fn get(&self) -> Duration {
        self.0
    }
}

/// When the table should look at the dataplane again.
#[derive(Clone, Debug)]
pub struct RecheckSchedule {
    opts: RecheckOptions,
    last_read: Instant,
    last_write: Instant,
    post_write_interval: Duration,
    pub peak_save: PeakDuration,
    pub peak_restore: PeakDuration,
}

impl RecheckSchedule {
    pub fn new(opts: RecheckOptions, now: Instant) -> Self {
        Self {
            opts,
            last_read: now,
            last_write: now,
            post_write_interval: opts.initial_post_write_interval,
            peak_save: PeakDuration::default(),
            peak_restore: PeakDuration::default(),
        }
    }

    fn post_write_active(&self) -> bool {
        self.post_write_interval < self.opts.post_write_cutoff
    }

    /// Reasons the cached view must be reloaded at `now`, advancing the post-write backoff.
    pub fn due(&mut self, now: Instant) -> Option<&'static str> {
        let mut reason = None;
        if !self.opts.refresh_interval.is_zero() && now.saturating_duration_since(self.last_read) > self.opts.refresh_interval {
            reason = Some("refresh interval");
        }
        while self.post_write_active() && now >= self.last_write + self.post_write_interval {
            self.post_write_interval *= 2;
            reason = reason.or(Some("post-write recheck"));
        }
        reason
    }

    pub fn record_read(&mut self, at: Instant) {
        self.last_read = at;
    }

    pub fn record_write(&mut self, at: Instant) {
        self.last_write = at;
        let estimate = (self.peak_save.get() + self.peak_restore.get()) * 2;
        self.post_write_interval = self.opts.initial_post_write_interval.max(estimate);
    }

    /// Delay until the next recheck, `None` when nothing needs rechecking.
    pub fn next_delay(&self, now: Instant) -> Option<Duration> {
        let refresh = (!self.opts.refresh_interval.is_zero())
            .then(|| self.opts.refresh_interval.saturating_sub(now.saturating_duration_since(self.last_read)));

        if !self.post_write_active() {
            return refresh;
        }
        let due_at = self.last_write + self.post_write_interval;
        let post_write = if due_at <= now {
            Duration::from_millis(1)
        } else {
            due_at - now
        };
        match refresh {
            Some(r) if r <= post_write => Some(r),
            _ => Some(post_write),
        }
    }
}
