// Hand-maintained to match migrations/; keep in sync when adding columns.

diesel::table! {
    printers (id) {
        id -> Int8,
        group_name -> Text,
        display_name -> Text,
        model -> Nullable<Text>,
        address_raw -> Nullable<Text>,
        consumables -> Array<Text>,
        status -> Nullable<Text>,
        status_detail -> Nullable<Text>,
        last_update -> Nullable<Timestamptz>,
        notes -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    printer_levels (printer_id, consumable) {
        printer_id -> Int8,
        consumable -> Text,
        value_text -> Text,
        level_pct -> Nullable<Float8>,
        observed_at -> Timestamptz,
    }
}

diesel::table! {
    ledger_entries (id) {
        id -> Int8,
        address -> Text,
        group_name -> Text,
        captured_at -> Timestamptz,
        status -> Text,
        status_detail -> Nullable<Text>,
        readings -> Jsonb,
        ingested_at -> Timestamptz,
    }
}

diesel::joinable!(printer_levels -> printers (printer_id));

diesel::allow_tables_to_appear_in_same_query!(printers, printer_levels, ledger_entries,);
