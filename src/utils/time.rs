use chrono::{DateTime, Utc};

/// Compact UTC timestamp token, e.g. `20240131T235959Z`. Handed to skills as
/// the run timestamp.
pub fn run_ts(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn new_run_id(run_ts: &str) -> String {
    format!("run_{}", run_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_id_format() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 5).unwrap();
        assert_eq!(run_ts(now), "20240131T235905Z");
        assert_eq!(new_run_id(&run_ts(now)), "run_20240131T235905Z");
    }
}
