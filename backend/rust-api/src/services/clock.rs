use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::SessionError;
use crate::models::SessionStatus;

/// Epoch numbers below this are taken as seconds rather than milliseconds.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that never steps backwards, even if the host clock does.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_millis: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let observed = Utc::now().timestamp_millis();
        let previous = self.last_millis.fetch_max(observed, Ordering::SeqCst);
        let millis = previous.max(observed);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Whole seconds since `start`, floored and never negative.
pub fn elapsed_seconds(start: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let millis = (now - start).num_milliseconds().max(0);
    u32::try_from(millis / 1000).unwrap_or(u32::MAX)
}

pub fn remaining_seconds(duration: u32, elapsed: u32) -> u32 {
    duration.saturating_sub(elapsed)
}

/// Timer reading for a session, gated by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerReading {
    pub elapsed_seconds: u32,
    pub remaining_seconds: u32,
}

impl TimerReading {
    pub fn is_expired(&self) -> bool {
        self.remaining_seconds == 0
    }
}

pub fn read_timer(
    status: SessionStatus,
    start_time: Option<DateTime<Utc>>,
    duration: u32,
    now: DateTime<Utc>,
) -> TimerReading {
    let not_running = TimerReading {
        elapsed_seconds: 0,
        remaining_seconds: duration,
    };
    match status {
        SessionStatus::Waiting | SessionStatus::Starting => not_running,
        SessionStatus::Finished => TimerReading {
            elapsed_seconds: start_time
                .map(|start| elapsed_seconds(start, now).min(duration))
                .unwrap_or(duration),
            remaining_seconds: 0,
        },
        SessionStatus::Cancelled => TimerReading {
            elapsed_seconds: 0,
            remaining_seconds: 0,
        },
        SessionStatus::Ongoing => match start_time {
            Some(start) => {
                let elapsed = elapsed_seconds(start, now);
                TimerReading {
                    elapsed_seconds: elapsed,
                    remaining_seconds: remaining_seconds(duration, elapsed),
                }
            }
            None => {
                tracing::warn!("Ongoing session without start_time; reporting full duration");
                not_running
            }
        },
    }
}

/// Converts any of the timestamp shapes clients and stores send into an
/// instant: RFC 3339 strings, epoch numbers (milliseconds, or seconds when
/// small), `{seconds, nanoseconds}` wrappers (with or without leading
/// underscores) and extended-JSON `{"$date": ...}` values.
pub fn normalize_instant(value: &Value) -> Result<DateTime<Utc>, SessionError> {
    let stale = || SessionError::StaleClockInput(truncate(value.to_string()));

    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| stale()),
        Value::Number(number) => {
            let raw = number
                .as_i64()
                .or_else(|| number.as_f64().map(|f| f as i64))
                .ok_or_else(stale)?;
            let millis = if raw.abs() < SECONDS_CUTOFF {
                raw.checked_mul(1000).ok_or_else(stale)?
            } else {
                raw
            };
            Utc.timestamp_millis_opt(millis).single().ok_or_else(stale)
        }
        Value::Object(map) => {
            if let Some(inner) = map.get("$date") {
                return match inner {
                    Value::Object(nested) => match nested.get("$numberLong") {
                        Some(Value::String(digits)) => digits
                            .parse::<i64>()
                            .ok()
                            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                            .ok_or_else(stale),
                        _ => Err(stale()),
                    },
                    Value::Number(number) => number
                        .as_i64()
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                        .ok_or_else(stale),
                    other => normalize_instant(other),
                };
            }

            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64);
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            match seconds {
                Some(secs) => Utc
                    .timestamp_opt(secs, u32::try_from(nanos).map_err(|_| stale())?)
                    .single()
                    .ok_or_else(stale),
                None => Err(stale()),
            }
        }
        _ => Err(stale()),
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > 120 {
        let mut cut = 120;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Serde hook for stored instants. An unrecognised shape is logged and read
/// as "unset" so the timer falls back to the not-started reading instead of
/// reporting a finished session.
pub fn lenient_instant<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match normalize_instant(&value) {
            Ok(instant) => Ok(Some(instant)),
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring unrecognized timestamp");
                Ok(None)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn elapsed_is_floored_and_clamped() {
        let start = t0();
        assert_eq!(elapsed_seconds(start, start + Duration::milliseconds(1999)), 1);
        assert_eq!(elapsed_seconds(start, start - Duration::seconds(5)), 0);
    }

    #[test]
    fn timer_is_gated_by_status() {
        let start = t0();
        let now = start + Duration::seconds(100);
        let waiting = read_timer(SessionStatus::Waiting, None, 420, now);
        assert_eq!(waiting.remaining_seconds, 420);
        let starting = read_timer(SessionStatus::Starting, Some(start), 420, now);
        assert_eq!(starting.remaining_seconds, 420);
        let ongoing = read_timer(SessionStatus::Ongoing, Some(start), 420, now);
        assert_eq!(ongoing.remaining_seconds, 320);
        assert_eq!(ongoing.elapsed_seconds, 100);
        let finished = read_timer(SessionStatus::Finished, Some(start), 420, now);
        assert_eq!(finished.remaining_seconds, 0);
    }

    #[test]
    fn ongoing_without_start_reports_full_duration() {
        let reading = read_timer(SessionStatus::Ongoing, None, 420, t0());
        assert_eq!(reading.remaining_seconds, 420);
        assert!(!reading.is_expired());
    }

    #[test]
    fn remaining_never_increases_while_ongoing() {
        let start = t0();
        let mut last = u32::MAX;
        for step in 0..500 {
            let now = start + Duration::milliseconds(step * 997);
            let reading = read_timer(SessionStatus::Ongoing, Some(start), 420, now);
            assert!(reading.remaining_seconds <= last);
            last = reading.remaining_seconds;
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn normalizes_all_timestamp_shapes() {
        let expected = t0();
        let millis = expected.timestamp_millis();
        let shapes = [
            json!("2025-03-01T09:00:00Z"),
            json!("2025-03-01T12:00:00+03:00"),
            json!(millis),
            json!(expected.timestamp()),
            json!({ "seconds": expected.timestamp(), "nanoseconds": 0 }),
            json!({ "_seconds": expected.timestamp(), "_nanoseconds": 0 }),
            json!({ "$date": { "$numberLong": millis.to_string() } }),
            json!({ "$date": millis }),
            json!({ "$date": "2025-03-01T09:00:00Z" }),
        ];
        for shape in shapes {
            assert_eq!(normalize_instant(&shape).unwrap(), expected, "{shape}");
        }
    }

    #[test]
    fn unknown_shape_is_stale_clock_input() {
        let err = normalize_instant(&json!({ "when": "soon" })).unwrap_err();
        assert!(matches!(err, SessionError::StaleClockInput(_)));
        assert!(normalize_instant(&json!(true)).is_err());
        assert!(normalize_instant(&json!("yesterday")).is_err());
    }

    #[test]
    fn lenient_field_falls_back_to_unset() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default, deserialize_with = "lenient_instant")]
            start_time: Option<DateTime<Utc>>,
        }

        let parsed: Holder = serde_json::from_value(json!({ "start_time": [1, 2] })).unwrap();
        assert!(parsed.start_time.is_none());
        let parsed: Holder = serde_json::from_value(json!({})).unwrap();
        assert!(parsed.start_time.is_none());
        let parsed: Holder =
            serde_json::from_value(json!({ "start_time": "2025-03-01T09:00:00Z" })).unwrap();
        assert_eq!(parsed.start_time, Some(t0()));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(t0());
        clock.advance(Duration::seconds(421));
        assert_eq!(clock.now(), t0() + Duration::seconds(421));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
