use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// HumanDuration
// ---------------------------------------------------------------------------

/// A duration parsed from a human-readable string like `"500ms"`, `"30s"`,
/// `"5m"`, `"1h"`, `"2d"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(Duration);

impl HumanDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_nanos(&self) -> i64 {
        self.0.as_nanos() as i64
    }
}

impl From<HumanDuration> for Duration {
    fn from(hd: HumanDuration) -> Self {
        hd.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl FromStr for HumanDuration {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("empty duration string");
        }

        let (num_part, suffix) = split_number_suffix(s)?;
        let value: u64 = num_part
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid number in duration: {s:?}"))?;

        let d = match suffix {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86400),
            _ => anyhow::bail!(
                "unsupported duration suffix {suffix:?} in {s:?} (expected ms/s/m/h/d)"
            ),
        };

        Ok(Self(d))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis == 0 {
            return write!(f, "0s");
        }
        if millis % 1000 != 0 {
            return write!(f, "{millis}ms");
        }
        let secs = self.0.as_secs();
        if secs % 86400 == 0 {
            write!(f, "{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Split a string like `"30s"` into `("30", "s")`.
fn split_number_suffix(s: &str) -> anyhow::Result<(&str, &str)> {
    let idx = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("missing suffix in {s:?}"))?;
    if idx == 0 {
        anyhow::bail!("missing numeric part in {s:?}");
    }
    Ok((&s[..idx], &s[idx..]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(
            "500ms".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_millis(500)
        );
        assert_eq!(
            "30s".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_secs(30)
        );
        assert_eq!(
            "5m".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_secs(300)
        );
        assert_eq!(
            "2d".parse::<HumanDuration>().unwrap().as_duration(),
            Duration::from_secs(2 * 86400)
        );
    }

    #[test]
    fn display_picks_largest_exact_unit() {
        assert_eq!("48h".parse::<HumanDuration>().unwrap().to_string(), "2d");
        assert_eq!("90s".parse::<HumanDuration>().unwrap().to_string(), "90s");
        assert_eq!(
            "1500ms".parse::<HumanDuration>().unwrap().to_string(),
            "1500ms"
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!("".parse::<HumanDuration>().is_err());
        assert!("30".parse::<HumanDuration>().is_err());
        assert!("30x".parse::<HumanDuration>().is_err());
        assert!("s".parse::<HumanDuration>().is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let d: HumanDuration = "30s".parse().unwrap();
        let json = serde_json::to_string(&d).unwrap();
        let d2: HumanDuration = serde_json::from_str(&json).unwrap();
        assert_eq!(d, d2);
    }
}
