use std::time::Duration as StdDuration;

use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime, PrimitiveDateTime};

/// Source of "now" for everything that persists timestamps or compares deadlines.
pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> PrimitiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        primitive_now_utc()
    }
}

pub(crate) fn primitive_now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

pub(crate) fn format_primitive(value: PrimitiveDateTime) -> String {
    value.assume_utc().format(&Rfc3339).unwrap_or_else(|_| value.assume_utc().to_string())
}

pub(crate) fn format_optional(value: Option<PrimitiveDateTime>) -> Option<String> {
    value.map(format_primitive)
}

pub(crate) fn add_std(value: PrimitiveDateTime, delta: StdDuration) -> PrimitiveDateTime {
    value.saturating_add(to_time_duration(delta))
}

pub(crate) fn sub_std(value: PrimitiveDateTime, delta: StdDuration) -> PrimitiveDateTime {
    value.saturating_sub(to_time_duration(delta))
}

pub(crate) fn days(count: u64) -> Duration {
    Duration::days(count.min(i64::MAX as u64) as i64)
}

fn to_time_duration(delta: StdDuration) -> Duration {
    Duration::try_from(delta).unwrap_or(Duration::MAX)
}
