use crate::client::Connector;
use crate::models::printer::ConsumableReading;
use crate::profiles::ProfileSet;
use crate::services::collect::{CollectSettings, Collector};
use crate::services::forecast::{self, AlertTier, ForecastRecord, ForecastSettings};
use crate::services::ledger::{self, LedgerStore};
use crate::services::reconcile;
use crate::services::registry::{self, Registry};
use chrono::Utc;
use diesel::PgConnection;
use log::{info, warn};
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

pub struct PassContext<'a, C: Connector> {
    pub connector: &'a C,
    pub profiles: &'a ProfileSet,
    pub collect: &'a CollectSettings,
    pub forecast: &'a ForecastSettings,
    pub forecast_output: &'a str,
}

pub fn run_loop<C: Connector>(
    conn: &mut PgConnection,
    ctx: &PassContext<'_, C>,
    interval: Duration,
    run_once: bool,
) -> Result<(), String> {
    let mut pass_no: u64 = 0;
    loop {
        let tick_start = Instant::now();
        pass_no += 1;

        info!("Pass {}: starting", pass_no);
        run_pass(conn, ctx)?;
        info!("Pass {}: done in {:.1}s", pass_no, tick_start.elapsed().as_secs_f64());

        if run_once {
            return Ok(());
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

/// Registry, collect (join), reconcile, ledger, forecast, output.
pub fn run_pass<C: Connector>(conn: &mut PgConnection, ctx: &PassContext<'_, C>) -> Result<(), String> {
    let registry = registry::load(conn)?;
    let readings = collect(&registry, ctx);

    let next = reconcile::reconcile(&registry.rows, &readings);
    reconcile::persist(conn, &registry.rows, &next)?;

    let stored = record_history(conn, &registry, &readings)?;
    info!("Ledger: {} new entry(ies)", stored);

    let records = forecast::forecast_devices(conn, &registry.devices, ctx.forecast, Utc::now())?;
    report_alerts(&records);
    forecast::write_records(&records, ctx.forecast_output)
}

fn collect<C: Connector>(registry: &Registry, ctx: &PassContext<'_, C>) -> Vec<ConsumableReading> {
    let targets = registry::collection_targets(&registry.devices);
    let collector = Collector::new(ctx.connector, ctx.profiles, ctx.collect);
    let readings = collector.collect_all(&targets);

    let ok = readings.iter().filter(|r| r.status.is_ok() && r.consumable.is_some()).count();
    info!(
        "Collect: {} reading(s) from {} device(s), {} ok",
        readings.len(),
        targets.len(),
        ok
    );
    readings
}

pub fn record_history<L: LedgerStore>(
    store: &mut L,
    registry: &Registry,
    readings: &[ConsumableReading],
) -> Result<usize, String> {
    let groups: HashMap<String, String> = registry
        .devices
        .iter()
        .filter_map(|d| d.address.clone().map(|a| (a, d.group.clone())))
        .collect();
    let entries = ledger::dedupe(ledger::entries_from_readings(readings, &groups, Utc::now()));
    store.append(&entries)
}

fn report_alerts(records: &[ForecastRecord]) {
    for r in records {
        if matches!(r.result.alert, AlertTier::Depleted | AlertTier::Critical | AlertTier::ReplaceSoon) {
            warn!(
                "{} ({}) {}: {} ({} day(s) left)",
                r.display_name,
                r.address,
                r.consumable,
                r.result.alert.label(),
                r.result
                    .days_remaining
                    .map(|d| format!("{:.1}", d))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }
}
