//! Domain types flowing through a collection pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// A monitored printer, as read from the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub printer_id: i64,
    pub group: String,
    pub display_name: String,
    pub model: Option<String>,
    /// Canonical dotted address; `None` when the registry value is unusable.
    pub address: Option<String>,
    /// Consumables the device is expected to report, in page order.
    pub consumables: Vec<String>,
}

/// Outcome of one collection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    Unavailable,
    OffNetwork,
    UnknownError(String),
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::NotFound => "not-found",
            Status::Unavailable => "unavailable",
            Status::OffNetwork => "off-network",
            Status::UnknownError(_) => "unknown-error",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Status::UnknownError(msg) => Some(msg.as_str()),
            _ => None,
        }
    }

    /// Rebuild a status from its persisted tag and optional detail column.
    pub fn from_parts(tag: &str, detail: Option<String>) -> Option<Status> {
        match tag {
            "ok" => Some(Status::Ok),
            "not-found" => Some(Status::NotFound),
            "unavailable" => Some(Status::Unavailable),
            "off-network" => Some(Status::OffNetwork),
            "unknown-error" => Some(Status::UnknownError(detail.unwrap_or_default())),
            _ => None,
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Status::UnknownError(msg) => write!(f, "unknown-error: {}", msg),
            other => f.write_str(other.as_str()),
        }
    }
}

/// What a locator chain produced for one consumable field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldValue {
    /// Text found and parsed as a level.
    Observed { raw: String, percent: f64 },
    /// Text found but not a level (e.g. `"--%"`).
    Unparsed { raw: String },
    /// No locator matched. Never an observation, never zero.
    Missing,
}

impl FieldValue {
    pub fn from_text(raw: &str) -> FieldValue {
        match crate::utils::parse_percentage(raw) {
            Some(percent) => FieldValue::Observed {
                raw: raw.to_string(),
                percent,
            },
            None => FieldValue::Unparsed { raw: raw.to_string() },
        }
    }

    pub fn raw(&self) -> Option<&str> {
        match self {
            FieldValue::Observed { raw, .. } | FieldValue::Unparsed { raw } => Some(raw.as_str()),
            FieldValue::Missing => None,
        }
    }
}

/// One observation (or failure) of one consumable at one capture instant.
///
/// Device-level failures carry `consumable: None` and `FieldValue::Missing`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumableReading {
    pub address: String,
    pub consumable: Option<String>,
    pub value: FieldValue,
    pub captured_at: DateTime<Utc>,
    pub status: Status,
}

impl ConsumableReading {
    pub fn device_failure(address: &str, captured_at: DateTime<Utc>, status: Status) -> Self {
        ConsumableReading {
            address: address.to_string(),
            consumable: None,
            value: FieldValue::Missing,
            captured_at,
            status,
        }
    }

    /// Normalized level; only present for an `ok` reading that observed a value.
    pub fn percent(&self) -> Option<f64> {
        match (&self.status, &self.value) {
            (Status::Ok, FieldValue::Observed { percent, .. }) => Some(*percent),
            _ => None,
        }
    }
}

/// Last known value of one consumable on a current-state row.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelValue {
    pub text: String,
    pub percent: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// The persisted, operator-facing row for one printer.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentStateRow {
    pub printer_id: i64,
    pub group: String,
    pub display_name: String,
    pub address: Option<String>,
    pub levels: BTreeMap<String, LevelValue>,
    pub status: Option<Status>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Immutable ledger record: one device attempt with all of its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub address: String,
    pub group: String,
    pub captured_at: DateTime<Utc>,
    pub status: Status,
    pub values: BTreeMap<String, FieldValue>,
    pub ingested_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Project this entry onto a single consumable.
    pub fn reading_for(&self, consumable: &str) -> ConsumableReading {
        ConsumableReading {
            address: self.address.clone(),
            consumable: Some(consumable.to_string()),
            value: self.values.get(consumable).cloned().unwrap_or(FieldValue::Missing),
            captured_at: self.captured_at,
            status: self.status.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_round_trips_through_columns() {
        let all = [
            Status::Ok,
            Status::NotFound,
            Status::Unavailable,
            Status::OffNetwork,
            Status::UnknownError("boom".into()),
        ];
        for status in all {
            let detail = status.detail().map(str::to_string);
            assert_eq!(Status::from_parts(status.as_str(), detail), Some(status));
        }
        assert_eq!(Status::from_parts("bogus", None), None);
    }

    #[test]
    fn percent_requires_ok_status() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let mut reading = ConsumableReading {
            address: "10.0.0.1".into(),
            consumable: Some("Black Toner".into()),
            value: FieldValue::from_text("42%"),
            captured_at: at,
            status: Status::Ok,
        };
        assert_eq!(reading.percent(), Some(42.0));

        reading.status = Status::Unavailable;
        assert_eq!(reading.percent(), None);

        reading.status = Status::Ok;
        reading.value = FieldValue::Missing;
        assert_eq!(reading.percent(), None);
    }

    #[test]
    fn missing_fields_project_as_missing() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let entry = LedgerEntry {
            address: "10.0.0.1".into(),
            group: "hp-supply-gauge".into(),
            captured_at: at,
            status: Status::Ok,
            values: BTreeMap::from([("Black Toner".to_string(), FieldValue::from_text("30%"))]),
            ingested_at: at,
        };
        assert_eq!(entry.reading_for("Black Toner").percent(), Some(30.0));
        assert_eq!(entry.reading_for("Feed Kit").value, FieldValue::Missing);
    }
}
