use std::collections::HashMap;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params, OptionalExtension};
use shared::mac::normalize_hardware_address;
use shared::types::{Device, DeviceState};
use super::{device_data_changed, merge_record, Registry};

const SELECT_DEVICE: &str = "SELECT hardware_address, network_address, vendor, known, state,
        first_seen, last_seen, open_services
 FROM devices";

pub struct SqliteRegistry {
    conn: Connection,
}

impl SqliteRegistry {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Enable WAL mode for better concurrency and crash recovery
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                hardware_address TEXT PRIMARY KEY,
                network_address  TEXT,
                vendor           TEXT NOT NULL DEFAULT '',
                known            INTEGER NOT NULL DEFAULT 0,
                state            TEXT NOT NULL CHECK (state IN ('up', 'down')),
                first_seen       TEXT NOT NULL,
                last_seen        TEXT NOT NULL,
                open_services    TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_devices_known ON devices(known);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Helper to convert a database row to Device
    fn row_to_device(row: &rusqlite::Row) -> Result<Device, rusqlite::Error> {
        let known_int: i32 = row.get(3)?;
        let state_str: String = row.get(4)?;
        let first_seen_str: String = row.get(5)?;
        let last_seen_str: String = row.get(6)?;
        let services_json: String = row.get(7)?;

        let state = state_str
            .parse::<DeviceState>()
            .map_err(|e| conversion_error(4, e.into()))?;
        let first_seen = decode_timestamp(&first_seen_str).map_err(|e| conversion_error(5, e))?;
        let last_seen = decode_timestamp(&last_seen_str).map_err(|e| conversion_error(6, e))?;
        let open_services = serde_json::from_str(&services_json)
            .map_err(|e| conversion_error(7, Box::new(e)))?;

        Ok(Device {
            hardware_address: row.get(0)?,
            network_address: row.get(1)?,
            vendor: row.get(2)?,
            known: known_int != 0,
            state,
            first_seen,
            last_seen,
            open_services,
        })
    }
}

fn conversion_error(
    column: usize,
    err: Box<dyn std::error::Error + Send + Sync>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err)
}

/// Fixed-width UTC timestamps at full nanosecond precision, so that text
/// comparison in SQL orders correctly and reads return what was written
fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, Box<dyn std::error::Error + Send + Sync>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn key(hardware_address: &str) -> String {
    normalize_hardware_address(hardware_address)
        .unwrap_or_else(|| hardware_address.to_ascii_uppercase())
}

fn get_on(conn: &Connection, hardware_address: &str) -> Result<Option<Device>> {
    conn.query_row(
        &format!("{SELECT_DEVICE} WHERE hardware_address = ?1"),
        params![key(hardware_address)],
        SqliteRegistry::row_to_device,
    )
    .optional()
    .context("Failed to query device")
}

fn upsert_on(conn: &Connection, device: &Device) -> Result<bool> {
    let mac = key(&device.hardware_address);
    let existing = get_on(conn, &mac)?;

    let changed = match &existing {
        Some(old) => device_data_changed(old, &merge_record(Some(old), device)),
        None => true,
    };

    let services_json = serde_json::to_string(&device.open_services)
        .context("Failed to serialize open services")?;

    // first_seen is only written by the INSERT branch
    conn.execute(
        r#"
        INSERT INTO devices (
            hardware_address, network_address, vendor, known, state,
            first_seen, last_seen, open_services
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, MAX(?6, ?7), ?8)
        ON CONFLICT(hardware_address) DO UPDATE SET
            network_address = excluded.network_address,
            vendor = excluded.vendor,
            known = MAX(devices.known, excluded.known),
            state = excluded.state,
            last_seen = MAX(devices.last_seen, excluded.last_seen),
            open_services = excluded.open_services
        "#,
        params![
            &mac,
            &device.network_address,
            &device.vendor,
            device.known as i32,
            device.state.as_str(),
            encode_timestamp(&device.first_seen),
            encode_timestamp(&device.last_seen),
            &services_json,
        ],
    )
    .with_context(|| format!("Failed to upsert device {}", mac))?;

    Ok(changed)
}

impl Registry for SqliteRegistry {
    fn load_all(&self) -> Result<HashMap<String, Device>> {
        let mut stmt = self
            .conn
            .prepare(SELECT_DEVICE)
            .context("Failed to prepare query")?;

        let devices = stmt
            .query_map([], Self::row_to_device)
            .context("Failed to query devices")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect devices")?;

        Ok(devices
            .into_iter()
            .map(|d| (d.hardware_address.clone(), d))
            .collect())
    }

    fn get(&self, hardware_address: &str) -> Result<Option<Device>> {
        get_on(&self.conn, hardware_address)
    }

    fn upsert(&mut self, device: &Device) -> Result<bool> {
        upsert_on(&self.conn, device)
    }

    fn replace_known(&mut self, devices: &[Device]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("Failed to start transaction")?;

        let removed = tx
            .execute("DELETE FROM devices WHERE known = 1", [])
            .context("Failed to clear known devices")?;

        for device in devices {
            upsert_on(&tx, device)?;
        }

        tx.commit().context("Failed to commit known devices")?;

        tracing::info!(
            "Replaced {} known devices with {} from initialization scan",
            removed,
            devices.len()
        );
        Ok(())
    }

    fn promote(&mut self, hardware_address: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE devices SET known = 1 WHERE hardware_address = ?1",
                params![key(hardware_address)],
            )
            .context("Failed to promote device")?;
        Ok(count > 0)
    }
}
