use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

/// Point-in-time view of a pipeline.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Stat {
    pub pipeline: String,
    pub broker: String,
    /// Broker specific name, e.g. the beanstalk tube.
    #[serde(rename = "internal-name")]
    pub internal_name: String,
    pub consuming: bool,
    /// Pending, not yet delivered.
    pub queue: i64,
    /// Currently executing.
    pub active: i64,
    /// Scheduled for a later delivery.
    pub delayed: i64,
}

/// Advisory counters, adjusted with atomics and never reset.
#[derive(Debug, Default)]
pub struct Counters {
    queue: AtomicI64,
    active: AtomicI64,
    delayed: AtomicI64,
}

macro_rules! counter {
    ($inc:ident, $dec:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $dec(&self) {
            self.$field.fetch_sub(1, Ordering::Relaxed);
        }
    };
}

impl Counters {
    counter!(inc_queue, dec_queue, queue);
    counter!(inc_active, dec_active, active);
    counter!(inc_delayed, dec_delayed, delayed);

    /// Copies the counters into `stat`.
    pub fn fill(&self, stat: &mut Stat) {
        stat.queue = self.queue.load(Ordering::Relaxed);
        stat.active = self.active.load(Ordering::Relaxed);
        stat.delayed = self.delayed.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = Counters::default();
        counters.inc_delayed();
        counters.inc_queue();
        counters.inc_queue();
        counters.dec_queue();
        counters.inc_active();

        let mut stat = Stat::default();
        counters.fill(&mut stat);
        assert_eq!((stat.queue, stat.active, stat.delayed), (1, 1, 1));
    }
}
