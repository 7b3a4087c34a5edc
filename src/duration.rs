//! Duration grammar and budget-reset intervals.
//!
//! Two distinct vocabularies live here:
//! - free-form durations (`"30s"`, `"15m"`, `"2h"`, `"7d"`, `"1w"`, `"1mo"`,
//!   `"1y"`) used by key-rotation intervals and invitation expiry;
//! - the closed `BudgetDuration` enum (`""`, `1d`, `7d`, `30d`) that drives
//!   the spend-reset schedule.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Parse a duration string.
///
/// Suffixes: `s`, `m`, `h`, `d`, `w`, `mo` (30 days), `y` (365 days).
/// Empty and `"-1"` mean "never" and return `None`.
/// An unknown suffix parses to a zero duration.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() || s == "-1" {
        return None;
    }

    // "mo" must be tried before "m".
    let seconds = if let Some(val) = s.strip_suffix("mo") {
        val.parse::<i64>().ok().map(|v| v * 86400 * 30)
    } else if let Some(val) = s.strip_suffix('s') {
        val.parse::<i64>().ok()
    } else if let Some(val) = s.strip_suffix('m') {
        val.parse::<i64>().ok().map(|v| v * 60)
    } else if let Some(val) = s.strip_suffix('h') {
        val.parse::<i64>().ok().map(|v| v * 3600)
    } else if let Some(val) = s.strip_suffix('d') {
        val.parse::<i64>().ok().map(|v| v * 86400)
    } else if let Some(val) = s.strip_suffix('w') {
        val.parse::<i64>().ok().map(|v| v * 86400 * 7)
    } else if let Some(val) = s.strip_suffix('y') {
        val.parse::<i64>().ok().map(|v| v * 86400 * 365)
    } else {
        None
    };

    Some(Duration::seconds(seconds.unwrap_or(0)))
}

/// Spend-reset interval attached to keys, teams, users, and budgets.
///
/// Only four values are legal; anything else is rejected at the admin
/// surface with a validation error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetDuration {
    #[default]
    #[serde(rename = "")]
    Never,
    #[serde(rename = "1d")]
    Daily,
    #[serde(rename = "7d")]
    Weekly,
    #[serde(rename = "30d")]
    Monthly,
}

impl BudgetDuration {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "" => Ok(BudgetDuration::Never),
            "1d" => Ok(BudgetDuration::Daily),
            "7d" => Ok(BudgetDuration::Weekly),
            "30d" => Ok(BudgetDuration::Monthly),
            other => Err(format!(
                "invalid budget duration '{}': expected one of \"\", 1d, 7d, 30d",
                other
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetDuration::Never => "",
            BudgetDuration::Daily => "1d",
            BudgetDuration::Weekly => "7d",
            BudgetDuration::Monthly => "30d",
        }
    }

    /// Canonical length in seconds. `None` for "never".
    ///
    /// These values are authoritative for both store backends; the SQL path
    /// advances reset timestamps from values computed here rather than from
    /// calendar `INTERVAL` literals.
    pub fn seconds(&self) -> Option<i64> {
        match self {
            BudgetDuration::Never => None,
            BudgetDuration::Daily => Some(86_400),
            BudgetDuration::Weekly => Some(7 * 86_400),
            BudgetDuration::Monthly => Some(30 * 86_400),
        }
    }

    /// Next reset timestamp from the given anchor. `None` for "never".
    pub fn next_reset(&self, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.seconds().map(|s| anchor + Duration::seconds(s))
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("30s"), Some(Duration::seconds(30)));
        assert_eq!(parse_duration("15m"), Some(Duration::seconds(900)));
        assert_eq!(parse_duration("2h"), Some(Duration::seconds(7200)));
        assert_eq!(parse_duration("1d"), Some(Duration::seconds(86400)));
        assert_eq!(parse_duration("1w"), Some(Duration::seconds(7 * 86400)));
        assert_eq!(parse_duration("1mo"), Some(Duration::seconds(30 * 86400)));
        assert_eq!(parse_duration("1y"), Some(Duration::seconds(365 * 86400)));
    }

    #[test]
    fn test_parse_duration_never() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("-1"), None);
        assert_eq!(parse_duration("  "), None);
    }

    #[test]
    fn test_parse_duration_unknown_suffix_is_zero() {
        assert_eq!(parse_duration("5x"), Some(Duration::zero()));
        assert_eq!(parse_duration("garbage"), Some(Duration::zero()));
        assert_eq!(parse_duration("42"), Some(Duration::zero()));
    }

    #[test]
    fn test_parse_duration_trims_whitespace() {
        assert_eq!(parse_duration(" 5m "), Some(Duration::seconds(300)));
    }

    #[test]
    fn test_budget_duration_parse() {
        assert_eq!(BudgetDuration::parse(""), Ok(BudgetDuration::Never));
        assert_eq!(BudgetDuration::parse("1d"), Ok(BudgetDuration::Daily));
        assert_eq!(BudgetDuration::parse("7d"), Ok(BudgetDuration::Weekly));
        assert_eq!(BudgetDuration::parse("30d"), Ok(BudgetDuration::Monthly));
        assert!(BudgetDuration::parse("2d").is_err());
        assert!(BudgetDuration::parse("monthly").is_err());
    }

    #[test]
    fn test_budget_duration_roundtrip() {
        for d in [
            BudgetDuration::Never,
            BudgetDuration::Daily,
            BudgetDuration::Weekly,
            BudgetDuration::Monthly,
        ] {
            assert_eq!(BudgetDuration::parse(d.as_str()), Ok(d));
        }
    }

    #[test]
    fn test_next_reset_canonical_seconds() {
        let anchor = Utc::now();
        assert_eq!(BudgetDuration::Never.next_reset(anchor), None);
        assert_eq!(
            BudgetDuration::Daily.next_reset(anchor),
            Some(anchor + Duration::seconds(86_400))
        );
        assert_eq!(
            BudgetDuration::Weekly.next_reset(anchor),
            Some(anchor + Duration::seconds(7 * 86_400))
        );
        assert_eq!(
            BudgetDuration::Monthly.next_reset(anchor),
            Some(anchor + Duration::seconds(30 * 86_400))
        );
    }

    #[test]
    fn test_budget_duration_serde_strings() {
        assert_eq!(
            serde_json::to_string(&BudgetDuration::Daily).unwrap(),
            "\"1d\""
        );
        let d: BudgetDuration = serde_json::from_str("\"30d\"").unwrap();
        assert_eq!(d, BudgetDuration::Monthly);
        let never: BudgetDuration = serde_json::from_str("\"\"").unwrap();
        assert_eq!(never, BudgetDuration::Never);
    }
}
