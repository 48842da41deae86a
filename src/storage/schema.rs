//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS buildings (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sensors (
            id TEXT PRIMARY KEY,
            building_id TEXT NOT NULL REFERENCES buildings(id),
            type TEXT NOT NULL,
            name TEXT NOT NULL,
            unit TEXT,
            location_detail TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sensor_readings (
            id INTEGER PRIMARY KEY,
            sensor_id TEXT NOT NULL REFERENCES sensors(id),
            value REAL NOT NULL,
            read_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            sensor_id TEXT REFERENCES sensors(id),
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'NEW',
            triggered_at TEXT NOT NULL,
            acknowledged_at TEXT,
            resolved_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sensors_building ON sensors(building_id);
        CREATE INDEX IF NOT EXISTS idx_readings_sensor_time ON sensor_readings(sensor_id, read_at);
        CREATE INDEX IF NOT EXISTS idx_alerts_dedup ON alerts(sensor_id, status, triggered_at);
        CREATE INDEX IF NOT EXISTS idx_alerts_triggered ON alerts(triggered_at);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}
