mod run;
mod session;

pub use run::RunFilter;
pub use session::SessionRecord;

pub(crate) use run::RunRow;
pub(crate) use session::SessionRow;

use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

pub(crate) fn datetime_to_epoch_seconds(value: DateTime<Utc>) -> i64 {
    value.timestamp()
}

pub(crate) fn epoch_seconds_to_datetime(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid unix timestamp: {secs}"))
}
