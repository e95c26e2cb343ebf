//! Signal database schema.
//!
//! The DDL below is the compatibility surface of the store: field deployments
//! carry these files across upgrades, so changes go through
//! `metadata.schema_version` and an explicit upgrade delta, never through
//! edits to the existing statements.

/// Current schema version recorded in the `metadata` table.
pub const SCHEMA_VERSION: i64 = 1;

/// `metadata` key/value table.
pub const CREATE_METADATA_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);";

/// `signals` table and its indices.
pub const CREATE_SIGNALS_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    frequency REAL NOT NULL,
    bandwidth REAL NOT NULL,
    power REAL NOT NULL,
    snr REAL NOT NULL,
    signal_class TEXT,
    confidence REAL,
    node_id TEXT NOT NULL,
    track_id TEXT,
    metadata TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_timestamp ON signals(timestamp);
CREATE INDEX IF NOT EXISTS idx_signals_frequency ON signals(frequency);
CREATE INDEX IF NOT EXISTS idx_signals_track_id ON signals(track_id);";

/// `geolocations` table and its indices. Rows cascade on signal deletion.
pub const CREATE_GEOLOCATIONS_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS geolocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    altitude REAL,
    accuracy REAL,
    signal_id INTEGER NOT NULL,
    track_id TEXT,
    confidence REAL,
    method TEXT NOT NULL,
    metadata TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY(signal_id) REFERENCES signals(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_geolocations_timestamp ON geolocations(timestamp);
CREATE INDEX IF NOT EXISTS idx_geolocations_signal_id ON geolocations(signal_id);
CREATE INDEX IF NOT EXISTS idx_geolocations_track_id ON geolocations(track_id);";

/// `events` table and its indices.
pub const CREATE_EVENTS_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    source TEXT NOT NULL,
    description TEXT NOT NULL,
    metadata TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);";

/// `reports` table and its indices.
pub const CREATE_REPORTS_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    report_type TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    parameters TEXT,
    format TEXT NOT NULL,
    file_path TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    created_by TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reports_timestamp ON reports(timestamp);
CREATE INDEX IF NOT EXISTS idx_reports_type ON reports(report_type);";

/// All table creation statements in dependency order.
pub const CREATE_TABLES: [&str; 5] = [
    CREATE_METADATA_TABLE,
    CREATE_SIGNALS_TABLE,
    CREATE_GEOLOCATIONS_TABLE,
    CREATE_EVENTS_TABLE,
    CREATE_REPORTS_TABLE,
];

/// Column lists used by the row mappers. Kept explicit so the mapping does
/// not depend on table column order.
pub const SIGNAL_COLUMNS: &str = "id, timestamp, frequency, bandwidth, power, snr, \
signal_class, confidence, node_id, track_id, metadata, created_at, updated_at";

/// Column list for geolocation rows.
pub const GEOLOCATION_COLUMNS: &str = "id, timestamp, latitude, longitude, altitude, \
accuracy, signal_id, track_id, confidence, method, metadata, created_at, updated_at";

/// Column list for event rows.
pub const EVENT_COLUMNS: &str =
    "id, timestamp, event_type, severity, source, description, metadata, created_at";

/// Column list for report rows.
pub const REPORT_COLUMNS: &str = "id, timestamp, report_type, title, description, \
parameters, format, file_path, created_at, created_by";

/// Order-by columns accepted for signal queries. Only these names are ever
/// interpolated into SQL text; all filter values are bound.
pub const SIGNAL_ORDER_COLUMNS: [&str; 7] = [
    "id",
    "timestamp",
    "frequency",
    "bandwidth",
    "power",
    "snr",
    "created_at",
];

/// Order-by columns accepted for geolocation queries.
pub const GEOLOCATION_ORDER_COLUMNS: [&str; 5] =
    ["id", "timestamp", "latitude", "longitude", "created_at"];

/// Order-by columns accepted for event queries.
pub const EVENT_ORDER_COLUMNS: [&str; 4] = ["id", "timestamp", "event_type", "created_at"];

/// Order-by columns accepted for report queries.
pub const REPORT_ORDER_COLUMNS: [&str; 4] = ["id", "timestamp", "report_type", "created_at"];
