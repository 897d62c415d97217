//! Per-stage and pipeline-wide statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for a single pipeline stage.
///
/// `prev` lets a stage compute how far it has fallen behind its upstream
/// neighbor (`behind()`) without the caller having to thread that
/// relationship through every call site.
pub struct StageStats {
    processed: AtomicU64,
    dropped: AtomicU64,
    last_iteration: AtomicU64,
    total_ns: AtomicU64,
    thread_count: AtomicU64,
    prev: Option<*const StageStats>,
}

// StageStats is shared behind `Arc` by worker threads; the raw `prev`
// pointer is set once at construction time and only ever read.
unsafe impl Send for StageStats {}
unsafe impl Sync for StageStats {}

impl StageStats {
    pub fn new(thread_count: u32) -> Self {
        Self {
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_iteration: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            thread_count: AtomicU64::new(thread_count as u64),
            prev: None,
        }
    }

    /// Wire `prev` as the stage immediately upstream of `self`, for `behind()`.
    ///
    /// # Safety
    /// `prev` must outlive `self`. Callers wire this once, at construction
    /// time, between fields of the same `PipelineStats` (or an equivalent
    /// structure pinned for the pipeline's lifetime).
    pub unsafe fn set_prev(&mut self, prev: *const StageStats) {
        self.prev = Some(prev);
    }

    pub fn set_thread_count(&self, count: u32) {
        self.thread_count.store(count as u64, Ordering::Relaxed);
    }

    pub fn frame_processed(&self, duration_ns: u64, iteration: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(duration_ns, Ordering::Relaxed);
        self.last_iteration.fetch_max(iteration, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self, iteration: u64) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.last_iteration.fetch_max(iteration, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn last_iteration(&self) -> u64 {
        self.last_iteration.load(Ordering::Relaxed)
    }

    pub fn total_ns(&self) -> u64 {
        self.total_ns.load(Ordering::Relaxed)
    }

    pub fn thread_count(&self) -> u32 {
        self.thread_count.load(Ordering::Relaxed) as u32
    }

    /// Frames per second, scaled by thread count (each worker contributes
    /// its own throughput). Zero when nothing has been processed yet.
    pub fn fps(&self) -> f32 {
        let processed = self.processed();
        if processed == 0 {
            return 0.0;
        }
        let total_s = self.total_ns() as f32 * 1e-9;
        if total_s <= 0.0 {
            return 0.0;
        }
        (processed as f32 / total_s) * self.thread_count() as f32
    }

    /// Average per-frame processing time, in whole milliseconds.
    pub fn avg_time_ms(&self) -> u64 {
        let processed = self.processed();
        if processed == 0 {
            return 0;
        }
        self.total_ns() / processed / 1_000_000
    }

    /// How far behind the previous stage's `last_iteration` this stage is,
    /// saturating at zero. Zero if there is no previous stage.
    pub fn behind(&self) -> u64 {
        match self.prev {
            // SAFETY: see `set_prev`.
            Some(prev) => {
                let prev = unsafe { &*prev };
                prev.last_iteration().saturating_sub(self.last_iteration())
            }
            None => 0,
        }
    }
}

/// Aggregates the five stages of the pipeline with their upstream wiring:
/// `read_join` follows `write`, `post` follows `read_join`, `callback`
/// follows `post`, and `total` follows `read_join` (it measures end-to-end
/// latency from the moment inference completes).
pub struct PipelineStats {
    pub write: Box<StageStats>,
    pub read_join: Box<StageStats>,
    pub post: Box<StageStats>,
    pub callback: Box<StageStats>,
    pub total: Box<StageStats>,
}

impl PipelineStats {
    pub fn new(write_threads: u32, read_threads: u32, post_threads: u32, callback_threads: u32) -> Self {
        let write = Box::new(StageStats::new(write_threads));
        let mut read_join = Box::new(StageStats::new(read_threads));
        let mut post = Box::new(StageStats::new(post_threads));
        let mut callback = Box::new(StageStats::new(callback_threads));
        let mut total = Box::new(StageStats::new(1));

        // SAFETY: each `prev` pointer targets a sibling field in this same
        // `Box`-pinned struct, which outlives every `StageStats` it wires.
        unsafe {
            read_join.set_prev(write.as_ref() as *const StageStats);
            post.set_prev(read_join.as_ref() as *const StageStats);
            callback.set_prev(post.as_ref() as *const StageStats);
            total.set_prev(read_join.as_ref() as *const StageStats);
        }

        Self {
            write,
            read_join,
            post,
            callback,
            total,
        }
    }

    /// Total frames currently owned by some stage of the pipeline (admitted
    /// but not yet processed or dropped by the callback stage).
    pub fn in_flight(&self) -> u64 {
        self.write
            .processed()
            .saturating_sub(self.callback.processed() + self.callback.dropped())
    }

    /// Sum of drops across every stage, reported as `total`'s dropped count
    /// (the `total` stage itself never evicts a frame).
    pub fn dropped_total(&self) -> u64 {
        self.write.dropped() + self.read_join.dropped() + self.post.dropped() + self.callback.dropped()
    }

    pub fn submitted(&self) -> u64 {
        self.write.processed() + self.write.dropped()
    }

    /// Render the fixed `{stage, processed, dropped, behind, threads, est_fps, avg_ms}` table.
    pub fn report(&self) -> String {
        let mut out = String::new();
        out.push_str("stage      processed   dropped   behind   threads   est_fps   avg_ms\n");
        let row = |name: &str, s: &StageStats, dropped_override: Option<u64>| {
            format!(
                "{:<10} {:>9}   {:>7}   {:>6}   {:>7}   {:>7.1}   {:>6}\n",
                name,
                s.processed(),
                dropped_override.unwrap_or_else(|| s.dropped()),
                s.behind(),
                s.thread_count(),
                s.fps(),
                s.avg_time_ms(),
            )
        };
        out.push_str(&row("write", &self.write, None));
        out.push_str(&row("read_join", &self.read_join, None));
        out.push_str(&row("post", &self.post, None));
        out.push_str(&row("callback", &self.callback, None));
        out.push_str(&row("total", &self.total, Some(self.dropped_total())));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stage_reports_zeros() {
        let s = StageStats::new(1);
        assert_eq!(s.processed(), 0);
        assert_eq!(s.dropped(), 0);
        assert_eq!(s.fps(), 0.0);
        assert_eq!(s.avg_time_ms(), 0);
        assert_eq!(s.behind(), 0);
    }

    #[test]
    fn frame_processed_updates_counters_monotonically() {
        let s = StageStats::new(1);
        s.frame_processed(1_000_000, 1);
        s.frame_processed(2_000_000, 2);
        assert_eq!(s.processed(), 2);
        assert_eq!(s.total_ns(), 3_000_000);
        assert_eq!(s.last_iteration(), 2);
        assert_eq!(s.avg_time_ms(), 1);
    }

    #[test]
    fn last_iteration_is_monotone_even_out_of_order() {
        let s = StageStats::new(1);
        s.frame_processed(0, 5);
        s.frame_processed(0, 3);
        assert_eq!(s.last_iteration(), 5);
    }

    #[test]
    fn frame_dropped_counts_separately_from_processed() {
        let s = StageStats::new(1);
        s.frame_dropped(1);
        s.frame_dropped(2);
        assert_eq!(s.dropped(), 2);
        assert_eq!(s.processed(), 0);
    }

    #[test]
    fn fps_scales_by_thread_count() {
        let s = StageStats::new(4);
        s.frame_processed(1_000_000_000, 1); // 1 frame in 1 second on one thread
        assert!((s.fps() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn behind_tracks_previous_stage_and_saturates_at_zero() {
        let mut stats = PipelineStats::new(1, 1, 1, 1);
        stats.write.frame_processed(0, 10);
        assert_eq!(stats.read_join.behind(), 10);
        stats.read_join.frame_processed(0, 10);
        assert_eq!(stats.read_join.behind(), 0);
        // read_join never goes "ahead" of write in a well-formed pipeline,
        // but behind() must not underflow if it does.
        stats.read_join.frame_processed(0, 20);
        assert_eq!(stats.read_join.behind(), 0);
    }

    #[test]
    fn total_dropped_is_pipeline_wide_sum() {
        let stats = PipelineStats::new(1, 1, 1, 1);
        stats.write.frame_dropped(1);
        stats.post.frame_dropped(2);
        stats.callback.frame_dropped(3);
        assert_eq!(stats.dropped_total(), 3);
    }

    #[test]
    fn report_contains_all_stage_rows() {
        let stats = PipelineStats::new(1, 4, 4, 2);
        let report = stats.report();
        for stage in ["write", "read_join", "post", "callback", "total"] {
            assert!(report.contains(stage), "missing row for {stage}");
        }
    }
}
