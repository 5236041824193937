//! Serde helpers for human-readable duration fields (`500ms`, `10s`, `1m30s`).

pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&durationfmt::to_string(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		let nanos = go_parse_duration::parse_duration(&raw)
			.map_err(|e| serde::de::Error::custom(format!("invalid duration {raw:?}: {e:?}")))?;
		u64::try_from(nanos)
			.map(Duration::from_nanos)
			.map_err(|_| serde::de::Error::custom(format!("negative duration {raw:?}")))
	}
}

pub mod serde_dur_option {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => s.serialize_some(&durationfmt::to_string(*d)),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		let raw: Option<String> = Option::deserialize(d)?;
		let Some(raw) = raw else {
			return Ok(None);
		};
		let nanos = go_parse_duration::parse_duration(&raw)
			.map_err(|e| serde::de::Error::custom(format!("invalid duration {raw:?}: {e:?}")))?;
		u64::try_from(nanos)
			.map(|n| Some(Duration::from_nanos(n)))
			.map_err(|_| serde::de::Error::custom(format!("negative duration {raw:?}")))
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use serde::{Deserialize, Serialize};

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	struct Wrapper {
		#[serde(with = "super::serde_dur")]
		dur: Duration,
		#[serde(default, with = "super::serde_dur_option")]
		opt: Option<Duration>,
	}

	#[test]
	fn round_trips_go_style_durations() {
		let w: Wrapper = serde_json::from_str(r#"{"dur":"1m30s","opt":"500ms"}"#).unwrap();
		assert_eq!(w.dur, Duration::from_secs(90));
		assert_eq!(w.opt, Some(Duration::from_millis(500)));

		let out = serde_json::to_string(&w).unwrap();
		let back: Wrapper = serde_json::from_str(&out).unwrap();
		assert_eq!(back, w);
	}

	#[test]
	fn rejects_garbage() {
		assert!(serde_json::from_str::<Wrapper>(r#"{"dur":"not a duration"}"#).is_err());
		assert!(serde_json::from_str::<Wrapper>(r#"{"dur":"-5s"}"#).is_err());
	}
}
