use crate::db::models as dbm;
use crate::models::printer::{CurrentStateRow, Device, LevelValue, Status};
use crate::schema;
use crate::utils::normalize_address;
use diesel::PgConnection;
use diesel::prelude::*;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};

/// Monitored devices plus their persisted current-state rows, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub devices: Vec<Device>,
    pub rows: Vec<CurrentStateRow>,
}

pub fn load(conn: &mut PgConnection) -> Result<Registry, String> {
    use schema::printer_levels::dsl as L;
    use schema::printers::dsl as P;

    let printers: Vec<dbm::Printer> = P::printers
        .order(P::id.asc())
        .select(dbm::Printer::as_select())
        .load(conn)
        .map_err(|e| format!("load printers failed: {}", e))?;
    let levels: Vec<dbm::PrinterLevel> = L::printer_levels
        .select(dbm::PrinterLevel::as_select())
        .load(conn)
        .map_err(|e| format!("load printer levels failed: {}", e))?;

    let registry = build(printers, levels);
    info!(
        "Registry: {} printer(s), {} with a usable address",
        registry.devices.len(),
        registry.devices.iter().filter(|d| d.address.is_some()).count()
    );
    Ok(registry)
}

/// Turn raw table rows into devices and current-state rows.
pub fn build(printers: Vec<dbm::Printer>, levels: Vec<dbm::PrinterLevel>) -> Registry {
    let mut by_printer: BTreeMap<i64, BTreeMap<String, LevelValue>> = BTreeMap::new();
    for level in levels {
        by_printer.entry(level.printer_id).or_default().insert(
            level.consumable,
            LevelValue {
                text: level.value_text,
                percent: level.level_pct,
                observed_at: level.observed_at,
            },
        );
    }

    let mut registry = Registry::default();
    for p in printers {
        let address = p.address_raw.as_deref().and_then(normalize_address);
        if address.is_none() {
            debug!("Registry: {} ({}) has no usable address", p.display_name, p.group_name);
        }
        let status = match p.status.as_deref() {
            Some(tag) => {
                let parsed = Status::from_parts(tag, p.status_detail.clone());
                if parsed.is_none() {
                    warn!("Registry: {} has unknown status tag {:?}", p.display_name, tag);
                }
                parsed
            }
            None => None,
        };

        registry.devices.push(Device {
            printer_id: p.id,
            group: p.group_name.clone(),
            display_name: p.display_name.clone(),
            model: p.model,
            address: address.clone(),
            consumables: p.consumables,
        });
        registry.rows.push(CurrentStateRow {
            printer_id: p.id,
            group: p.group_name,
            display_name: p.display_name,
            address,
            levels: by_printer.remove(&p.id).unwrap_or_default(),
            status,
            last_update: p.last_update,
        });
    }
    registry
}

/// Devices to actually visit: addressed, and one per address.
///
/// Later duplicates are dropped with a warning; reconciliation still applies
/// the collected result to every row carrying that address.
pub fn collection_targets(devices: &[Device]) -> Vec<Device> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for device in devices {
        let Some(address) = device.address.as_deref() else {
            warn!(
                "Registry: skipping {} ({}): empty or invalid address",
                device.display_name, device.group
            );
            continue;
        };
        if !seen.insert(address.to_string()) {
            warn!(
                "Registry: {} ({}) shares address {} with another printer; collecting once",
                device.display_name, device.group, address
            );
            continue;
        }
        targets.push(device.clone());
    }
    targets
}
