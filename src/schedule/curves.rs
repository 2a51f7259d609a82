use crate::types::Outcome;

use super::{Review, ReviewSchedule};

/// One minute in milliseconds.
pub const MINUTE_MS: u64 = 60 * 1000;
/// One hour in milliseconds.
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
/// One day in milliseconds.
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Integer parameters of an interval curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Curve {
    /// Interval after a first review that was not forgotten.
    pub initial_interval: u64,
    /// Growth factor numerator.
    pub growth_num: u64,
    /// Growth factor denominator.
    pub growth_den: u64,
    /// Growth never pushes past this, though a larger prior interval is kept.
    pub max_interval: u64,
    /// Floor for a shrunk interval.
    pub min_interval: u64,
    /// Delay before a forgotten task is due again.
    pub retry_delay: u64,
    /// Delay before a skipped task is due again.
    pub skip_delay: u64,
}

/// Curve registered as `"default"`.
pub const DEFAULT_CURVE: Curve = Curve {
    initial_interval: 5 * DAY_MS,
    growth_num: 23,
    growth_den: 10,
    max_interval: 730 * DAY_MS,
    min_interval: HOUR_MS,
    retry_delay: 10 * MINUTE_MS,
    skip_delay: DAY_MS,
};

/// Curve registered as `"aggressiveStart"`.
pub const AGGRESSIVE_START_CURVE: Curve = Curve {
    initial_interval: DAY_MS,
    growth_num: 3,
    growth_den: 1,
    max_interval: 730 * DAY_MS,
    min_interval: HOUR_MS,
    retry_delay: 10 * MINUTE_MS,
    skip_delay: DAY_MS,
};

pub(crate) fn default_schedule(prior: Option<&ReviewSchedule>, review: Review) -> ReviewSchedule {
    DEFAULT_CURVE.next(prior, review)
}

pub(crate) fn aggressive_start_schedule(
    prior: Option<&ReviewSchedule>,
    review: Review,
) -> ReviewSchedule {
    AGGRESSIVE_START_CURVE.next(prior, review)
}

impl Curve {
    /// Applies one review to `prior`.
    pub fn next(&self, prior: Option<&ReviewSchedule>, review: Review) -> ReviewSchedule {
        let at = review.timestamp_millis;
        match prior {
            None => self.first(review),
            Some(p) => match review.outcome {
                Outcome::Remembered => {
                    let elapsed = p
                        .last_review_timestamp_millis
                        .map_or(0, |last| at.saturating_sub(last));
                    let base = p.interval_millis.max(elapsed);
                    let grown = base.saturating_mul(self.growth_num) / self.growth_den;
                    let interval = grown.min(self.max_interval).max(p.interval_millis);
                    ReviewSchedule {
                        interval_millis: interval,
                        due_timestamp_millis: at.saturating_add(interval),
                        last_review_timestamp_millis: Some(at),
                        review_count: p.review_count.saturating_add(1),
                        lapse_count: p.lapse_count,
                    }
                }
                Outcome::Forgotten => {
                    let interval = (p.interval_millis / 2)
                        .max(self.min_interval)
                        .min(p.interval_millis);
                    ReviewSchedule {
                        interval_millis: interval,
                        due_timestamp_millis: at.saturating_add(self.retry_delay),
                        last_review_timestamp_millis: Some(at),
                        review_count: p.review_count.saturating_add(1),
                        lapse_count: p.lapse_count.saturating_add(1),
                    }
                }
                Outcome::Skipped => ReviewSchedule {
                    due_timestamp_millis: at.saturating_add(self.skip_delay),
                    ..p.clone()
                },
            },
        }
    }

    fn first(&self, review: Review) -> ReviewSchedule {
        let at = review.timestamp_millis;
        match review.outcome {
            Outcome::Remembered => ReviewSchedule {
                interval_millis: self.initial_interval,
                due_timestamp_millis: at.saturating_add(self.initial_interval),
                last_review_timestamp_millis: Some(at),
                review_count: 1,
                lapse_count: 0,
            },
            Outcome::Forgotten => ReviewSchedule {
                interval_millis: self.min_interval,
                due_timestamp_millis: at.saturating_add(self.retry_delay),
                last_review_timestamp_millis: Some(at),
                review_count: 1,
                lapse_count: 1,
            },
            Outcome::Skipped => ReviewSchedule {
                interval_millis: self.initial_interval,
                due_timestamp_millis: at.saturating_add(self.skip_delay),
                last_review_timestamp_millis: None,
                review_count: 0,
                lapse_count: 0,
            },
        }
    }
}
