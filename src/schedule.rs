use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::Error;

/// Day offsets from a topic's anchor date for repetitions #1..#8.
/// Fixed policy, not per-user configurable.
pub const REVIEW_INTERVALS: [i64; 8] = [1, 3, 7, 21, 42, 90, 180, 365];

/// Number of repetitions scheduled for every topic.
pub const REVIEW_COUNT: usize = REVIEW_INTERVALS.len();

/// All date arithmetic runs in UTC. A topic's anchor date is its creation
/// timestamp truncated to a UTC calendar date.
pub fn anchor_date(created_at: DateTime<Utc>) -> NaiveDate {
    created_at.date_naive()
}

/// "Today" for dispatch and summary purposes.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Computes the full review schedule for an anchor date: one date per
/// repetition number, strictly increasing.
pub fn review_dates(anchor: NaiveDate) -> Result<[NaiveDate; REVIEW_COUNT], Error> {
    let mut dates = [anchor; REVIEW_COUNT];
    for (slot, offset) in dates.iter_mut().zip(REVIEW_INTERVALS) {
        *slot = anchor
            .checked_add_signed(Duration::days(offset))
            .ok_or(Error::InvalidAnchorDate)?;
    }
    Ok(dates)
}

/// A repetition is due when it is not completed and its scheduled date is on
/// or before the reference date.
pub fn is_due(scheduled: NaiveDate, completed: bool, reference: NaiveDate) -> bool {
    !completed && scheduled <= reference
}

/// Overdue means strictly before the reference date. Computed, never stored.
pub fn is_overdue(scheduled: NaiveDate, reference: NaiveDate) -> bool {
    scheduled < reference
}
