use chrono::{DateTime, Datelike, Utc};

/// Coarse temporal partition key embedded in every normalized ALS table row:
/// `(year-2022)*12 + (month-1)`. Once a row is inserted under a given month index
/// it must never be overwritten by an insert carrying a different one.
pub fn month_idx_at(ts: DateTime<Utc>) -> i32 {
    (ts.year() - 2022) * 12 + (ts.month() as i32 - 1)
}

pub fn current_month_idx() -> i32 {
    month_idx_at(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn month_idx_epoch() {
        let ts = Utc.with_ymd_and_hms(2022, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(month_idx_at(ts), 0);
    }

    #[test]
    fn month_idx_rolls_over_year() {
        let ts = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(month_idx_at(ts), 12);
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(month_idx_at(ts), 29);
    }
}
