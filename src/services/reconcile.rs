//! Merge a pass's fresh readings into the current-state rows.
//!
//! The merge is asymmetric: a successful read overwrites the consumable
//! values it observed, a failed read only overwrites status and timestamp.
//! Rows without a fresh reading pass through untouched, so a device that has
//! been off the network for weeks still shows its last good levels.

use crate::db::models as dbm;
use crate::models::printer::{ConsumableReading, CurrentStateRow, FieldValue, LevelValue, Status};
use crate::schema;
use crate::utils::format_percentage;
use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;
use log::{debug, info};
use std::collections::BTreeMap;

/// Everything the pass learned about one address.
#[derive(Debug, Clone, PartialEq)]
struct Outcome {
    status: Status,
    captured_at: DateTime<Utc>,
    values: Vec<(String, FieldValue)>,
}

fn outcomes(fresh: &[ConsumableReading]) -> BTreeMap<&str, Outcome> {
    let mut by_address: BTreeMap<&str, Outcome> = BTreeMap::new();
    for reading in fresh {
        let outcome = by_address.entry(reading.address.as_str()).or_insert_with(|| Outcome {
            status: reading.status.clone(),
            captured_at: reading.captured_at,
            values: Vec::new(),
        });
        if reading.captured_at > outcome.captured_at {
            outcome.captured_at = reading.captured_at;
        }
        // any ok reading makes the attempt ok
        if reading.status.is_ok() {
            outcome.status = Status::Ok;
        }
        if let (Status::Ok, Some(name)) = (&reading.status, &reading.consumable) {
            outcome.values.push((name.clone(), reading.value.clone()));
        }
    }
    by_address
}

/// Apply fresh readings to the previous rows; keyed by address.
pub fn reconcile(previous: &[CurrentStateRow], fresh: &[ConsumableReading]) -> Vec<CurrentStateRow> {
    let by_address = outcomes(fresh);

    previous
        .iter()
        .map(|row| {
            let Some(outcome) = row.address.as_deref().and_then(|a| by_address.get(a)) else {
                return row.clone();
            };
            let mut next = row.clone();
            next.status = Some(outcome.status.clone());
            next.last_update = Some(outcome.captured_at);

            if outcome.status.is_ok() {
                for (name, value) in &outcome.values {
                    let level = match value {
                        FieldValue::Observed { percent, .. } => LevelValue {
                            text: format_percentage(*percent),
                            percent: Some(*percent),
                            observed_at: outcome.captured_at,
                        },
                        FieldValue::Unparsed { raw } => LevelValue {
                            text: raw.clone(),
                            percent: None,
                            observed_at: outcome.captured_at,
                        },
                        FieldValue::Missing => continue,
                    };
                    next.levels.insert(name.clone(), level);
                }
            }
            next
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub rows_updated: usize,
    pub levels_written: usize,
}

/// Write the columns the reconciler owns for rows that changed.
///
/// `previous` and `next` must be index-aligned (as returned by `reconcile`).
pub fn persist(
    conn: &mut PgConnection,
    previous: &[CurrentStateRow],
    next: &[CurrentStateRow],
) -> Result<PersistSummary, String> {
    use schema::printer_levels::dsl as L;
    use schema::printers::dsl as P;

    if previous.len() != next.len() {
        return Err(format!(
            "persist: row count mismatch ({} previous, {} next)",
            previous.len(),
            next.len()
        ));
    }

    let now = Utc::now();
    let mut status_updates = Vec::new();
    let mut level_rows = Vec::new();
    for (before, after) in previous.iter().zip(next) {
        if before.status != after.status || before.last_update != after.last_update {
            status_updates.push((
                after.printer_id,
                dbm::PrinterStatusUpdate {
                    status: after.status.as_ref().map(|s| s.as_str().to_string()),
                    status_detail: after.status.as_ref().and_then(|s| s.detail()).map(str::to_string),
                    last_update: after.last_update,
                    updated_at: now,
                },
            ));
        }
        for (name, level) in &after.levels {
            if before.levels.get(name) != Some(level) {
                level_rows.push(dbm::NewPrinterLevel {
                    printer_id: after.printer_id,
                    consumable: name.clone(),
                    value_text: level.text.clone(),
                    level_pct: level.percent,
                    observed_at: level.observed_at,
                });
            }
        }
    }

    let summary = PersistSummary {
        rows_updated: status_updates.len(),
        levels_written: level_rows.len(),
    };
    if summary == PersistSummary::default() {
        debug!("Reconcile: nothing to persist");
        return Ok(summary);
    }

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        for (id, update) in &status_updates {
            diesel::update(P::printers.find(*id)).set(update).execute(conn)?;
        }
        if !level_rows.is_empty() {
            diesel::insert_into(L::printer_levels)
                .values(&level_rows)
                .on_conflict((L::printer_id, L::consumable))
                .do_update()
                .set((
                    L::value_text.eq(excluded(L::value_text)),
                    L::level_pct.eq(excluded(L::level_pct)),
                    L::observed_at.eq(excluded(L::observed_at)),
                ))
                .execute(conn)?;
        }
        Ok(())
    })
    .map_err(|e| format!("persist current state failed: {}", e))?;

    info!(
        "Reconcile: {} printer row(s) updated, {} level(s) written",
        summary.rows_updated, summary.levels_written
    );
    Ok(summary)
}
