use crate::models::ProfileKind;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

pub(crate) fn dedupe_hash_hex(key: &str) -> String {
    let digest = Sha256::digest(key.trim().as_bytes());
    format!("{digest:x}")
}

pub(crate) fn instant_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One alert per sensor, profile and run date.
pub(crate) fn notification_key(sensor_id: i32, profile: ProfileKind, run_date: NaiveDate) -> String {
    format!("notify:{}:{}:{}", profile.as_str(), run_date.format("%Y-%m-%d"), sensor_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hash_ignores_surrounding_whitespace() {
        let a = dedupe_hash_hex("run_profile:sleep:2026-10-19T06:00:00Z");
        let b = dedupe_hash_hex("  run_profile:sleep:2026-10-19T06:00:00Z\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, dedupe_hash_hex("run_profile:work:2026-10-19T06:00:00Z"));
    }

    #[test]
    fn keys_are_stable_text() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 19, 6, 0, 0).unwrap();
        assert_eq!(instant_key(ts), "2026-10-19T06:00:00Z");

        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(
            notification_key(42, ProfileKind::Work, date),
            "notify:work:2026-10-19:42"
        );
    }
}
