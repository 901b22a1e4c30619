use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// The current UTC time truncated to whole seconds.
///
/// Hash preimages and the wire format carry timestamps at seconds
/// precision, so every timestamp that enters an entity is truncated
/// at the source.
pub fn now() -> DateTime<Utc> {
  truncate(Utc::now())
}

pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
  ts - Duration::nanoseconds(ts.timestamp_subsec_nanos() as i64)
}

/// Canonical ISO-8601 rendering: RFC 3339, UTC, seconds precision,
/// `Z` suffix. This exact string feeds the hash preimages.
pub fn iso(ts: &DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Serde adapter for timestamp fields in the canonical entity JSON.
pub mod serde {
  use {
    super::{iso, truncate},
    chrono::{DateTime, Utc},
    serde::{de, Deserialize, Deserializer, Serializer},
  };

  pub fn serialize<S>(
    ts: &DateTime<Utc>,
    serializer: S,
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&iso(ts))
  }

  pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    let parsed = DateTime::parse_from_rfc3339(&s).map_err(de::Error::custom)?;
    Ok(truncate(parsed.with_timezone(&Utc)))
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{iso, now, truncate},
    chrono::{TimeZone, Utc},
  };

  #[test]
  fn iso_is_seconds_precision_utc() {
    let ts = Utc.ymd(2024, 5, 17).and_hms(8, 30, 5);
    assert_eq!(iso(&ts), "2024-05-17T08:30:05+00:00".replace("+00:00", "Z"));
    assert_eq!(iso(&ts), "2024-05-17T08:30:05Z");
  }

  #[test]
  fn now_is_truncated() {
    let ts = now();
    assert_eq!(ts.timestamp_subsec_nanos(), 0);
    assert_eq!(truncate(ts), ts);
  }

  #[test]
  fn serde_round_trip() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct Wrapper {
      #[serde(with = "crate::primitives::time::serde")]
      ts: chrono::DateTime<Utc>,
    }

    let ts = Utc.ymd(2024, 5, 17).and_hms(8, 30, 5);
    let json = serde_json::to_string(&Wrapper { ts }).unwrap();
    assert_eq!(json, r#"{"ts":"2024-05-17T08:30:05Z"}"#);
    let back: Wrapper = serde_json::from_str(&json).unwrap();
    assert_eq!(back.ts, ts);
  }
}
