//! Derived Redis key names.
//!
//! External tooling reads these keys directly, so the layout is fixed.

use crate::queue::Queue;

/// Which stats counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stat {
    Total,
    Success,
    Failed,
    Processing,
}

impl Stat {
    pub(crate) const ALL: [Stat; 4] = [Stat::Total, Stat::Success, Stat::Failed, Stat::Processing];

    fn suffix(self) -> &'static str {
        match self {
            Stat::Total => "total",
            Stat::Success => "success",
            Stat::Failed => "failed",
            Stat::Processing => "processing",
        }
    }
}

/// Every key the engine derives for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKeys {
    /// Main stream
    pub stream: String,
    /// Dead-letter stream
    pub dlq: String,
    /// Sorted set of delayed entries scored by due time in milliseconds
    pub delayed: String,
    /// Consumer group name
    pub group: String,
    /// Hash of schedule id to serialized schedule
    pub schedules: String,
    /// Sorted set of schedule ids scored by next run in milliseconds
    pub schedule_next: String,
    stats_prefix: String,
}

impl StreamKeys {
    pub fn new(queue: &Queue) -> Self {
        let ns = queue.namespace();
        let name = queue.name();

        Self {
            stream: format!("{ns}.stream.{name}"),
            dlq: format!("{ns}.stream.{name}.dlq"),
            delayed: format!("{ns}.delayed.{name}"),
            group: format!("{ns}.group.{name}"),
            schedules: format!("{ns}.schedules.{name}"),
            schedule_next: format!("{ns}.schedule.next.{name}"),
            stats_prefix: format!("{ns}.stats.{name}"),
        }
    }

    pub(crate) fn stat(&self, stat: Stat) -> String {
        format!("{}.{}", self.stats_prefix, stat.suffix())
    }
}
