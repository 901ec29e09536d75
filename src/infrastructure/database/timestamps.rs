use chrono::{DateTime, TimeZone, Utc};

// Values below this are taken to be seconds written by an older build.
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

fn utc_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now)
}

pub fn to_epoch_millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn utc_from_epoch_millis_lossy(ms: i64) -> DateTime<Utc> {
    let candidate = if ms.abs() < MILLIS_THRESHOLD { ms * 1000 } else { ms };

    if let Some(dt) = Utc.timestamp_millis_opt(candidate).single() {
        if candidate != ms {
            log::warn!("Coerced seconds timestamp to millis (ms={ms})");
        }
        return dt;
    }

    log::warn!("Invalid epoch millis timestamp (ms={ms}); falling back to epoch");
    utc_epoch()
}

pub fn utc_from_epoch_millis_lossy_opt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(utc_from_epoch_millis_lossy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_millis() {
        let now = Utc.timestamp_millis_opt(1_760_000_000_123).single().unwrap();
        assert_eq!(utc_from_epoch_millis_lossy(to_epoch_millis(&now)), now);
    }

    #[test]
    fn seconds_are_coerced() {
        let dt = utc_from_epoch_millis_lossy(1_760_000_000);
        assert_eq!(dt.timestamp(), 1_760_000_000);
    }

    #[test]
    fn out_of_range_falls_back_to_epoch() {
        assert_eq!(utc_from_epoch_millis_lossy(i64::MAX), utc_epoch());
        assert_eq!(utc_from_epoch_millis_lossy_opt(None), None);
    }
}
