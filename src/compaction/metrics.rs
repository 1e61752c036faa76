//! Pipeline observability counters.
//!
//! Plain counters, not atomics: the engine is single-threaded by
//! construction. A snapshot is just a copy.

/// Cumulative counters for the compaction pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionMetrics {
    /// Bars whose first beat has run.
    pub bars_started: u64,
    /// Bars finalised at a last beat.
    pub bars_finished: u64,
    /// Beats entered.
    pub beats_started: u64,
    /// Beats whose end-of-beat tick has fired.
    pub beats_finished: u64,
    /// Read blips issued.
    pub blip_reads: u64,
    /// Merge blips issued.
    pub blip_merges: u64,
    /// Write blips issued.
    pub blip_writes: u64,
    /// Merges that reported the beat's budget consumed.
    pub beat_exhaustions: u64,
    /// Merges that reported their bar's work complete.
    pub bar_exhaustions: u64,
    /// Manifest log compaction increments started alongside a beat.
    pub manifest_log_compactions: u64,
}
