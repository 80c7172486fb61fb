use crate::db::models::NewPrinter;
use crate::models::printer::{Device, FieldValue, LedgerEntry, Status};
use crate::schema;
use crate::services::ledger::LedgerStore;
use crate::utils::format_percentage;
use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use diesel::PgConnection;
use diesel::prelude::*;
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const DEMO_NAME_SUFFIX: &str = " (demo)";
const HISTORY_DAYS: i64 = 180;
const BATCH_SIZE: usize = 500;
const REFILL_BELOW: f64 = 4.0;

struct DemoPrinter {
    group: &'static str,
    name: &'static str,
    model: &'static str,
    address: &'static str,
    consumables: &'static [&'static str],
    /// Mean consumption in percent per working day for each consumable.
    usage: &'static [f64],
}

const DEMO_PRINTERS: [DemoPrinter; 4] = [
    DemoPrinter {
        group: "hp-supply-gauge",
        name: "reception",
        model: "LaserJet M404",
        // digits only, as operators often paste them
        address: "192000002010",
        consumables: &["Black Toner", "Maintenance Kit"],
        usage: &[1.4, 0.15],
    },
    DemoPrinter {
        group: "ricoh-mono",
        name: "accounting",
        model: "IM 430",
        address: "192.0.2.20",
        consumables: &["Black Toner", "Black Imaging Unit"],
        usage: &[2.2, 0.35],
    },
    DemoPrinter {
        group: "ricoh-color",
        name: "marketing",
        model: "IM C3000",
        address: "192.0.2.30",
        consumables: &["Black Toner", "Cyan Toner", "Magenta Toner", "Yellow Toner"],
        usage: &[1.8, 0.9, 1.1, 0.7],
    },
    DemoPrinter {
        group: "ricoh-mono",
        name: "warehouse",
        model: "SP 5300",
        address: "",
        consumables: &["Black Toner"],
        usage: &[0.5],
    },
];

pub fn run(conn: &mut PgConnection) -> Result<(), String> {
    let devices = ensure_printers(conn)?;
    let (start, end) = history_window(Utc::now()).ok_or("Fake data: history window out of range")?;
    let mut rng = SmallRng::seed_from_u64(0x7013_E12D_0C5E_ED42u64);

    info!(
        "Fake data: generating {} day(s) of history for {} demo printer(s)",
        HISTORY_DAYS,
        devices.len()
    );
    let entries = synthesize(&devices, start, end, &mut rng);

    let mut inserted = 0;
    for chunk in entries.chunks(BATCH_SIZE) {
        inserted += conn.append(chunk)?;
    }
    info!(
        "Fake data: complete (entries={}, inserted={})",
        entries.len(),
        inserted
    );
    Ok(())
}

/// Whole UTC days ending at the start of `now`'s day, so a restart on the
/// same day produces the same ledger keys.
fn history_window(now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let end = now.date_naive().and_hms_opt(0, 0, 0)?.and_utc();
    let start = end.checked_sub_signed(Duration::days(HISTORY_DAYS))?;
    Some((start, end))
}

/// Minute past midnight a demo device "reports" at; fixed per address.
fn capture_offset(address: &str) -> Duration {
    let minute = address.bytes().map(u64::from).sum::<u64>() % 60;
    Duration::hours(9) + Duration::minutes(minute as i64)
}

fn ensure_printers(conn: &mut PgConnection) -> Result<Vec<Device>, String> {
    use schema::printers::dsl as P;

    let mut devices = Vec::with_capacity(DEMO_PRINTERS.len());
    for demo in &DEMO_PRINTERS {
        let row = NewPrinter {
            group_name: demo.group.to_string(),
            display_name: format!("{}{}", demo.name, DEMO_NAME_SUFFIX),
            model: Some(demo.model.to_string()),
            address_raw: Some(demo.address.to_string()),
            consumables: demo.consumables.iter().map(|c| c.to_string()).collect(),
        };
        let id: i64 = diesel::insert_into(P::printers)
            .values(&row)
            .on_conflict((P::group_name, P::display_name))
            .do_update()
            .set((
                P::model.eq(row.model.clone()),
                P::address_raw.eq(row.address_raw.clone()),
                P::consumables.eq(row.consumables.clone()),
                P::updated_at.eq(Utc::now()),
            ))
            .returning(P::id)
            .get_result(conn)
            .map_err(|e| format!("upsert demo printer {} failed: {}", row.display_name, e))?;

        devices.push(Device {
            printer_id: id,
            group: row.group_name,
            display_name: row.display_name,
            model: row.model,
            address: crate::utils::normalize_address(demo.address),
            consumables: row.consumables,
        });
    }
    Ok(devices)
}

/// One reading per device per day, with weekend lulls, occasional outages
/// and cartridge swaps once a level runs low.
fn synthesize(devices: &[Device], start: DateTime<Utc>, end: DateTime<Utc>, rng: &mut SmallRng) -> Vec<LedgerEntry> {
    let mut entries = Vec::new();
    for device in devices {
        let Some(address) = device.address.as_deref() else {
            continue;
        };
        let usage = DEMO_PRINTERS
            .iter()
            .find(|d| device.display_name.starts_with(d.name) && d.group == device.group)
            .map(|d| d.usage)
            .unwrap_or(&[]);
        let mut levels: Vec<f64> = device
            .consumables
            .iter()
            .map(|_| rng.random_range(60.0..=100.0))
            .collect();

        let offset = capture_offset(address);
        let mut day = start;
        while day < end {
            let captured_at = day + offset;
            let weekend = matches!(day.weekday(), Weekday::Sat | Weekday::Sun);

            for (i, level) in levels.iter_mut().enumerate() {
                let mean = usage.get(i).copied().unwrap_or(0.5);
                let factor = if weekend { 0.1 } else { rng.random_range(0.4..=1.6) };
                *level -= mean * factor;
                if *level < REFILL_BELOW && rng.random_bool(0.5) {
                    *level = 100.0;
                }
                *level = level.clamp(0.0, 100.0);
            }

            let entry = if rng.random_bool(0.04) {
                let status = if rng.random_bool(0.7) {
                    Status::OffNetwork
                } else {
                    Status::Unavailable
                };
                LedgerEntry {
                    address: address.to_string(),
                    group: device.group.clone(),
                    captured_at,
                    status,
                    values: BTreeMap::new(),
                    ingested_at: captured_at,
                }
            } else {
                let values = device
                    .consumables
                    .iter()
                    .zip(&levels)
                    .map(|(name, level)| (name.clone(), FieldValue::from_text(&format_percentage(*level))))
                    .collect();
                LedgerEntry {
                    address: address.to_string(),
                    group: device.group.clone(),
                    captured_at,
                    status: Status::Ok,
                    values,
                    ingested_at: captured_at,
                }
            };
            entries.push(entry);
            day += Duration::days(1);
        }
    }
    entries
}
