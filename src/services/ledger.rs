use crate::db::models as dbm;
use crate::models::printer::{ConsumableReading, FieldValue, LedgerEntry, Status};
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Append-only storage of ledger entries.
///
/// Entries are never updated or deleted. `append` ignores entries whose
/// (address, captured_at) key is already stored.
pub trait LedgerStore {
    /// Returns how many entries were actually stored.
    fn append(&mut self, entries: &[LedgerEntry]) -> Result<usize, String>;

    /// All entries for one address, in no particular order.
    fn entries_for(&mut self, address: &str) -> Result<Vec<LedgerEntry>, String>;
}

/// Fold a pass's readings into one entry per device attempt.
///
/// `groups` maps address to the device group recorded with the entry.
pub fn entries_from_readings(
    readings: &[ConsumableReading],
    groups: &HashMap<String, String>,
    ingested_at: DateTime<Utc>,
) -> Vec<LedgerEntry> {
    let mut by_key: BTreeMap<(&str, DateTime<Utc>), LedgerEntry> = BTreeMap::new();
    for reading in readings {
        let entry = by_key
            .entry((reading.address.as_str(), reading.captured_at))
            .or_insert_with(|| LedgerEntry {
                address: reading.address.clone(),
                group: groups.get(&reading.address).cloned().unwrap_or_default(),
                captured_at: reading.captured_at,
                status: reading.status.clone(),
                values: BTreeMap::new(),
                ingested_at,
            });
        if reading.status.is_ok() {
            entry.status = Status::Ok;
        }
        if let Some(name) = &reading.consumable {
            entry.values.insert(name.clone(), reading.value.clone());
        }
    }
    by_key.into_values().collect()
}

/// Drop repeated keys, keeping the first entry seen for each.
pub fn dedupe(entries: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert((e.address.clone(), e.captured_at)))
        .collect()
}

/// Time series of one consumable, ascending by capture time.
///
/// Device-level failures are included as non-ok readings so callers see the
/// full history; only ok observations carry a percentage.
pub fn series(entries: &[LedgerEntry], consumable: &str) -> Vec<ConsumableReading> {
    let mut out: Vec<ConsumableReading> = entries.iter().map(|e| e.reading_for(consumable)).collect();
    out.sort_by_key(|r| r.captured_at);
    out
}

impl LedgerStore for PgConnection {
    fn append(&mut self, entries: &[LedgerEntry]) -> Result<usize, String> {
        use schema::ledger_entries::dsl as E;

        if entries.is_empty() {
            return Ok(0);
        }

        let mut rows = Vec::with_capacity(entries.len());
        for e in entries {
            let readings =
                serde_json::to_value(&e.values).map_err(|err| format!("encode ledger values failed: {}", err))?;
            rows.push(dbm::NewLedgerRow {
                address: e.address.clone(),
                group_name: e.group.clone(),
                captured_at: e.captured_at,
                status: e.status.as_str().to_string(),
                status_detail: e.status.detail().map(str::to_string),
                readings,
                ingested_at: e.ingested_at,
            });
        }

        diesel::insert_into(E::ledger_entries)
            .values(&rows)
            .on_conflict((E::address, E::captured_at))
            .do_nothing()
            .execute(self)
            .map_err(|e| format!("insert ledger entries failed: {}", e))
    }

    fn entries_for(&mut self, address: &str) -> Result<Vec<LedgerEntry>, String> {
        use schema::ledger_entries::dsl as E;

        let rows: Vec<dbm::LedgerRow> = E::ledger_entries
            .filter(E::address.eq(address))
            .select(dbm::LedgerRow::as_select())
            .load(self)
            .map_err(|e| format!("load ledger for {} failed: {}", address, e))?;
        Ok(rows.into_iter().filter_map(entry_from_row).collect())
    }
}

fn entry_from_row(row: dbm::LedgerRow) -> Option<LedgerEntry> {
    let Some(status) = Status::from_parts(&row.status, row.status_detail) else {
        warn!("Ledger: entry {} has unknown status {:?}; skipped", row.id, row.status);
        return None;
    };
    let values: BTreeMap<String, FieldValue> = match serde_json::from_value(row.readings) {
        Ok(v) => v,
        Err(e) => {
            warn!("Ledger: entry {} has undecodable readings: {}", row.id, e);
            return None;
        }
    };
    debug!("Ledger: loaded entry {} ({} at {})", row.id, row.address, row.captured_at);
    Some(LedgerEntry {
        address: row.address,
        group: row.group_name,
        captured_at: row.captured_at,
        status,
        values,
        ingested_at: row.ingested_at,
    })
}

/// In-memory store keeping insertion order.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryLedger {
    pub entries: Vec<LedgerEntry>,
}

#[cfg(test)]
impl LedgerStore for MemoryLedger {
    fn append(&mut self, entries: &[LedgerEntry]) -> Result<usize, String> {
        let mut stored = 0;
        for e in entries {
            let exists = self
                .entries
                .iter()
                .any(|x| x.address == e.address && x.captured_at == e.captured_at);
            if !exists {
                self.entries.push(e.clone());
                stored += 1;
            }
        }
        Ok(stored)
    }

    fn entries_for(&mut self, address: &str) -> Result<Vec<LedgerEntry>, String> {
        Ok(self.entries.iter().filter(|e| e.address == address).cloned().collect())
    }
}
