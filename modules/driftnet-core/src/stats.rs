//! Aggregated counters for one harvest run.

use std::fmt;

#[derive(Debug, Clone, Default)]
pub struct HarvestStats {
    pub searches: u32,
    pub permit_waits: u32,
    pub permits_skipped: u32,
    pub notes_opened: u32,
    pub notes_skipped_dup: u32,
    pub notes_persisted: u32,
    pub comments_collected: u32,
    pub comments_partial: u32,
    pub recoveries: u32,
    pub recovery_failures: u32,
    pub items_skipped_error: u32,
}

impl fmt::Display for HarvestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "searches: {} ({} permit waits, {} skipped), notes opened: {} ({} dup-skipped), \
             persisted: {}, comments: {} ({} partial), recoveries: {} ({} failed), \
             errors skipped: {}",
            self.searches,
            self.permit_waits,
            self.permits_skipped,
            self.notes_opened,
            self.notes_skipped_dup,
            self.notes_persisted,
            self.comments_collected,
            self.comments_partial,
            self.recoveries,
            self.recovery_failures,
            self.items_skipped_error,
        )
    }
}
