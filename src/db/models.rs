//! Diesel row structs for the registry, the current-state tables and the ledger.
//!
//! `printers` is operator-managed: the service reads every column but only
//! ever writes `status`, `status_detail`, `last_update` and `updated_at`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::schema;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schema::printers)]
pub struct Printer {
    pub id: i64,
    pub group_name: String,
    pub display_name: String,
    pub model: Option<String>,
    pub address_raw: Option<String>,
    pub consumables: Vec<String>,
    pub status: Option<String>,
    pub status_detail: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Used by the demo seeder only; operators manage real rows by hand.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::printers)]
pub struct NewPrinter {
    pub group_name: String,
    pub display_name: String,
    pub model: Option<String>,
    pub address_raw: Option<String>,
    pub consumables: Vec<String>,
}

#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = schema::printers)]
#[diesel(treat_none_as_null = true)]
pub struct PrinterStatusUpdate {
    pub status: Option<String>,
    pub status_detail: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = schema::printer_levels)]
#[diesel(primary_key(printer_id, consumable))]
#[diesel(belongs_to(Printer))]
pub struct PrinterLevel {
    pub printer_id: i64,
    pub consumable: String,
    pub value_text: String,
    pub level_pct: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::printer_levels)]
pub struct NewPrinterLevel {
    pub printer_id: i64,
    pub consumable: String,
    pub value_text: String,
    pub level_pct: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schema::ledger_entries)]
pub struct LedgerRow {
    pub id: i64,
    pub address: String,
    pub group_name: String,
    pub captured_at: DateTime<Utc>,
    pub status: String,
    pub status_detail: Option<String>,
    pub readings: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::ledger_entries)]
pub struct NewLedgerRow {
    pub address: String,
    pub group_name: String,
    pub captured_at: DateTime<Utc>,
    pub status: String,
    pub status_detail: Option<String>,
    pub readings: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
}
