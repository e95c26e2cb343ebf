//! Signal database.
//!
//! An embedded relational store for detections, geolocations, events and
//! generated reports, backed by SQLite. The connection sits behind a guard
//! that enforces the single-writer, many-reader discipline; every filter
//! value is bound, and only whitelisted order-by column names ever appear in
//! SQL text. On top of the store, [`query`] provides the domain search facade
//! and [`report`] the templated report engine.

use chrono::{DateTime, Utc};
use rusqlite::backup::Backup;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

pub mod query;
pub mod report;
pub mod schema;

/// Errors returned by the signal database.
#[derive(Error, Debug)]
pub enum DbError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,
    /// A query parameter failed validation, for example an order-by column
    /// outside the whitelist.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The on-disk schema is newer than this binary supports.
    #[error("schema version mismatch: found {found}, supported {supported}")]
    SchemaMismatch {
        /// Version recorded in the database file.
        found: i64,
        /// Version supported by this binary.
        supported: i64,
    },
    /// Filesystem failure during backup or restore.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Event severities, ordered from least to most severe.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EventSeverity {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Degraded but functional.
    Warning,
    /// Operation failed.
    Error,
    /// Subsystem failure.
    Critical,
}

impl EventSeverity {
    /// Text stored in the `severity` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Debug => "DEBUG",
            EventSeverity::Info => "INFO",
            EventSeverity::Warning => "WARNING",
            EventSeverity::Error => "ERROR",
            EventSeverity::Critical => "CRITICAL",
        }
    }

    /// Parses a stored severity; unknown text maps to `Info`.
    pub fn from_str_lossy(s: &str) -> EventSeverity {
        match s {
            "DEBUG" => EventSeverity::Debug,
            "WARNING" => EventSeverity::Warning,
            "ERROR" => EventSeverity::Error,
            "CRITICAL" => EventSeverity::Critical,
            _ => EventSeverity::Info,
        }
    }

    /// All severities at or above this one.
    fn at_least(&self) -> impl Iterator<Item = EventSeverity> + '_ {
        [
            EventSeverity::Debug,
            EventSeverity::Info,
            EventSeverity::Warning,
            EventSeverity::Error,
            EventSeverity::Critical,
        ]
        .into_iter()
        .filter(move |s| s >= self)
    }
}

/// A detected signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRecord {
    /// Row id, assigned by the store on insert.
    pub id: Option<i64>,
    /// Detection time.
    pub timestamp: DateTime<Utc>,
    /// Center frequency in Hz.
    pub frequency: f64,
    /// Bandwidth in Hz.
    pub bandwidth: f64,
    /// Power in dBm.
    pub power: f64,
    /// Signal to noise ratio in dB.
    pub snr: f64,
    /// Classifier label, if classified.
    pub signal_class: Option<String>,
    /// Classifier confidence in [0, 1].
    pub confidence: Option<f64>,
    /// Detecting node.
    pub node_id: String,
    /// Correlator track tag.
    pub track_id: Option<String>,
    /// Opaque structured document.
    pub metadata: Option<serde_json::Value>,
    /// Set by the store on insert.
    pub created_at: DateTime<Utc>,
    /// Set by the store on insert and update.
    pub updated_at: DateTime<Utc>,
}

/// A geolocation fix for a signal.
#[derive(Debug, Clone, PartialEq)]
pub struct GeolocationRecord {
    /// Row id, assigned by the store on insert.
    pub id: Option<i64>,
    /// Fix time.
    pub timestamp: DateTime<Utc>,
    /// Latitude in degrees, in [-90, 90].
    pub latitude: f64,
    /// Longitude in degrees, in [-180, 180].
    pub longitude: f64,
    /// Altitude in meters, if known.
    pub altitude: Option<f64>,
    /// Horizontal accuracy in meters, if known.
    pub accuracy: Option<f64>,
    /// Signal this fix belongs to. Rows cascade on signal deletion.
    pub signal_id: i64,
    /// Correlator track tag.
    pub track_id: Option<String>,
    /// Solver confidence.
    pub confidence: Option<f64>,
    /// Geolocation method, for example `TDOA` or `AOA`.
    pub method: String,
    /// Opaque structured document.
    pub metadata: Option<serde_json::Value>,
    /// Set by the store on insert.
    pub created_at: DateTime<Utc>,
    /// Set by the store on insert and update.
    pub updated_at: DateTime<Utc>,
}

/// A platform event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Row id, assigned by the store on insert.
    pub id: Option<i64>,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Event kind.
    pub event_type: String,
    /// Severity.
    pub severity: EventSeverity,
    /// Producing component.
    pub source: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque structured document.
    pub metadata: Option<serde_json::Value>,
    /// Set by the store on insert.
    pub created_at: DateTime<Utc>,
}

/// A generated report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRecord {
    /// Row id, assigned by the store on insert.
    pub id: Option<i64>,
    /// Report time.
    pub timestamp: DateTime<Utc>,
    /// Template name the report was generated from.
    pub report_type: String,
    /// Title.
    pub title: String,
    /// Description.
    pub description: Option<String>,
    /// Generation parameters.
    pub parameters: Option<serde_json::Value>,
    /// Export format name.
    pub format: String,
    /// Where the exported file was written.
    pub file_path: String,
    /// Set by the store on insert.
    pub created_at: DateTime<Utc>,
    /// Operator or scheduler that created the report.
    pub created_by: String,
}

/// Filters for signal queries. Every field is optional; unset fields do not
/// constrain the result.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Earliest timestamp, inclusive.
    pub start_time: Option<DateTime<Utc>>,
    /// Latest timestamp, inclusive.
    pub end_time: Option<DateTime<Utc>>,
    /// Lowest frequency in Hz, inclusive.
    pub min_frequency: Option<f64>,
    /// Highest frequency in Hz, inclusive.
    pub max_frequency: Option<f64>,
    /// Power floor in dBm.
    pub min_power: Option<f64>,
    /// SNR floor in dB.
    pub min_snr: Option<f64>,
    /// Exact classifier label.
    pub signal_class: Option<String>,
    /// Exact track tag.
    pub track_id: Option<String>,
    /// Exact node id.
    pub node_id: Option<String>,
    /// Row limit.
    pub limit: Option<u64>,
    /// Row offset; applied only together with a limit.
    pub offset: Option<u64>,
    /// Order-by column; must be in the signal whitelist.
    pub order_by: Option<String>,
    /// Sort direction; ascending when unset.
    pub ascending: Option<bool>,
}

/// Filters for geolocation queries.
#[derive(Debug, Clone, Default)]
pub struct GeoQueryParams {
    /// Earliest timestamp, inclusive.
    pub start_time: Option<DateTime<Utc>>,
    /// Latest timestamp, inclusive.
    pub end_time: Option<DateTime<Utc>>,
    /// Southern bound in degrees.
    pub min_latitude: Option<f64>,
    /// Northern bound in degrees.
    pub max_latitude: Option<f64>,
    /// Western bound in degrees.
    pub min_longitude: Option<f64>,
    /// Eastern bound in degrees.
    pub max_longitude: Option<f64>,
    /// Confidence floor.
    pub min_confidence: Option<f64>,
    /// Exact geolocation method.
    pub method: Option<String>,
    /// Exact track tag.
    pub track_id: Option<String>,
    /// Row limit.
    pub limit: Option<u64>,
    /// Row offset; applied only together with a limit.
    pub offset: Option<u64>,
    /// Order-by column; must be in the geolocation whitelist.
    pub order_by: Option<String>,
    /// Sort direction; ascending when unset.
    pub ascending: Option<bool>,
}

/// Filters for event queries.
#[derive(Debug, Clone, Default)]
pub struct EventQueryParams {
    /// Earliest timestamp, inclusive.
    pub start_time: Option<DateTime<Utc>>,
    /// Latest timestamp, inclusive.
    pub end_time: Option<DateTime<Utc>>,
    /// Exact event kind.
    pub event_type: Option<String>,
    /// Lowest severity to include.
    pub min_severity: Option<EventSeverity>,
    /// Exact producing component.
    pub source: Option<String>,
    /// Substring match on the description.
    pub description_contains: Option<String>,
    /// Row limit.
    pub limit: Option<u64>,
    /// Row offset; applied only together with a limit.
    pub offset: Option<u64>,
    /// Order-by column; must be in the event whitelist.
    pub order_by: Option<String>,
    /// Sort direction; ascending when unset.
    pub ascending: Option<bool>,
}

/// Filters for report queries.
#[derive(Debug, Clone, Default)]
pub struct ReportQueryParams {
    /// Earliest timestamp, inclusive.
    pub start_time: Option<DateTime<Utc>>,
    /// Latest timestamp, inclusive.
    pub end_time: Option<DateTime<Utc>>,
    /// Exact template name.
    pub report_type: Option<String>,
    /// Substring match on the title.
    pub title_contains: Option<String>,
    /// Exact format name.
    pub format: Option<String>,
    /// Exact creator.
    pub created_by: Option<String>,
    /// Row limit.
    pub limit: Option<u64>,
    /// Row offset; applied only together with a limit.
    pub offset: Option<u64>,
    /// Order-by column; must be in the report whitelist.
    pub order_by: Option<String>,
    /// Sort direction; ascending when unset.
    pub ascending: Option<bool>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DbStats {
    /// Total signal rows.
    pub total_signals: u64,
    /// Total geolocation rows.
    pub total_geolocations: u64,
    /// Total event rows.
    pub total_events: u64,
    /// Total report rows.
    pub total_reports: u64,
    /// Database file size in bytes.
    pub db_size_bytes: u64,
    /// Oldest signal timestamp, if any signals exist.
    pub oldest_record: Option<DateTime<Utc>>,
    /// Newest signal timestamp, if any signals exist.
    pub newest_record: Option<DateTime<Utc>>,
}

fn to_millis(t: &DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn json_text(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn json_value(text: Option<String>) -> Option<serde_json::Value> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

fn order_clause(
    order_by: &Option<String>,
    ascending: Option<bool>,
    limit: Option<u64>,
    offset: Option<u64>,
    whitelist: &[&str],
) -> Result<String, DbError> {
    let mut sql = String::new();
    if let Some(column) = order_by {
        if !whitelist.contains(&column.as_str()) {
            return Err(DbError::InvalidQuery(format!(
                "order-by column not allowed: {column}"
            )));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(column);
        sql.push_str(if ascending.unwrap_or(true) {
            " ASC"
        } else {
            " DESC"
        });
    }
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }
    Ok(sql)
}

/// The embedded signal store.
///
/// Opening the store creates the schema on first use and verifies the
/// recorded schema version, applying upgrade deltas where needed.
#[derive(Debug)]
pub struct SignalDb {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SignalDb {
    /// Opens (and if needed creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<SignalDb, DbError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        for ddl in schema::CREATE_TABLES {
            conn.execute_batch(ddl)?;
        }
        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES ('schema_version', ?1)",
            params![schema::SCHEMA_VERSION.to_string()],
        )?;
        let db = SignalDb {
            conn: Mutex::new(conn),
            path,
        };
        db.upgrade_schema()?;
        Ok(db)
    }

    /// Returns the schema version recorded in the store.
    pub fn schema_version(&self) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let value: String = conn.query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        value
            .parse()
            .map_err(|_| DbError::InvalidQuery("unparseable schema version".to_string()))
    }

    fn upgrade_schema(&self) -> Result<(), DbError> {
        let found = self.schema_version()?;
        if found > schema::SCHEMA_VERSION {
            return Err(DbError::SchemaMismatch {
                found,
                supported: schema::SCHEMA_VERSION,
            });
        }
        // Version deltas go here. At v1 there is nothing to apply.
        if found < schema::SCHEMA_VERSION {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE metadata SET value = ?1 WHERE key = 'schema_version'",
                params![schema::SCHEMA_VERSION.to_string()],
            )?;
        }
        Ok(())
    }

    // ---- signals ----

    /// Inserts a signal and returns its assigned id.
    pub fn insert_signal(&self, signal: &SignalRecord) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO signals (timestamp, frequency, bandwidth, power, snr, \
             signal_class, confidence, node_id, track_id, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                to_millis(&signal.timestamp),
                signal.frequency,
                signal.bandwidth,
                signal.power,
                signal.snr,
                signal.signal_class,
                signal.confidence,
                signal.node_id,
                signal.track_id,
                json_text(&signal.metadata),
                now,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Updates a signal in place. The record must carry its id.
    pub fn update_signal(&self, signal: &SignalRecord) -> Result<(), DbError> {
        let id = signal.id.ok_or(DbError::NotFound)?;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE signals SET timestamp = ?1, frequency = ?2, bandwidth = ?3, \
             power = ?4, snr = ?5, signal_class = ?6, confidence = ?7, node_id = ?8, \
             track_id = ?9, metadata = ?10, updated_at = ?11 WHERE id = ?12",
            params![
                to_millis(&signal.timestamp),
                signal.frequency,
                signal.bandwidth,
                signal.power,
                signal.snr,
                signal.signal_class,
                signal.confidence,
                signal.node_id,
                signal.track_id,
                json_text(&signal.metadata),
                Utc::now().timestamp_millis(),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Deletes a signal; geolocation rows referencing it cascade.
    pub fn delete_signal(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM signals WHERE id = ?1", params![id])? > 0)
    }

    /// Fetches a signal by id.
    pub fn get_signal(&self, id: i64) -> Result<Option<SignalRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM signals WHERE id = ?1",
            schema::SIGNAL_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![id], row_to_signal)
            .optional()?)
    }

    fn signal_where(params: &QueryParams) -> (String, Vec<Value>) {
        let mut sql = String::from(" WHERE 1=1");
        let mut values: Vec<Value> = Vec::new();
        if let Some(t) = &params.start_time {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Integer(to_millis(t)));
        }
        if let Some(t) = &params.end_time {
            sql.push_str(" AND timestamp <= ?");
            values.push(Value::Integer(to_millis(t)));
        }
        if let Some(f) = params.min_frequency {
            sql.push_str(" AND frequency >= ?");
            values.push(Value::Real(f));
        }
        if let Some(f) = params.max_frequency {
            sql.push_str(" AND frequency <= ?");
            values.push(Value::Real(f));
        }
        if let Some(p) = params.min_power {
            sql.push_str(" AND power >= ?");
            values.push(Value::Real(p));
        }
        if let Some(s) = params.min_snr {
            sql.push_str(" AND snr >= ?");
            values.push(Value::Real(s));
        }
        if let Some(c) = &params.signal_class {
            sql.push_str(" AND signal_class = ?");
            values.push(Value::Text(c.clone()));
        }
        if let Some(t) = &params.track_id {
            sql.push_str(" AND track_id = ?");
            values.push(Value::Text(t.clone()));
        }
        if let Some(n) = &params.node_id {
            sql.push_str(" AND node_id = ?");
            values.push(Value::Text(n.clone()));
        }
        (sql, values)
    }

    /// Queries signals with typed filters.
    pub fn query_signals(&self, params: &QueryParams) -> Result<Vec<SignalRecord>, DbError> {
        let (where_sql, values) = Self::signal_where(params);
        let tail = order_clause(
            &params.order_by,
            params.ascending,
            params.limit,
            params.offset,
            &schema::SIGNAL_ORDER_COLUMNS,
        )?;
        let sql = format!(
            "SELECT {} FROM signals{where_sql}{tail}",
            schema::SIGNAL_COLUMNS
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_signal)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Counts the signals matching the filters, ignoring pagination.
    pub fn count_signals(&self, params: &QueryParams) -> Result<u64, DbError> {
        let (where_sql, values) = Self::signal_where(params);
        let sql = format!("SELECT COUNT(*) FROM signals{where_sql}");
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))?;
        Ok(count as u64)
    }

    // ---- geolocations ----

    /// Inserts a geolocation and returns its assigned id.
    pub fn insert_geolocation(&self, geo: &GeolocationRecord) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO geolocations (timestamp, latitude, longitude, altitude, accuracy, \
             signal_id, track_id, confidence, method, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                to_millis(&geo.timestamp),
                geo.latitude,
                geo.longitude,
                geo.altitude,
                geo.accuracy,
                geo.signal_id,
                geo.track_id,
                geo.confidence,
                geo.method,
                json_text(&geo.metadata),
                now,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Updates a geolocation in place. The record must carry its id.
    pub fn update_geolocation(&self, geo: &GeolocationRecord) -> Result<(), DbError> {
        let id = geo.id.ok_or(DbError::NotFound)?;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE geolocations SET timestamp = ?1, latitude = ?2, longitude = ?3, \
             altitude = ?4, accuracy = ?5, signal_id = ?6, track_id = ?7, confidence = ?8, \
             method = ?9, metadata = ?10, updated_at = ?11 WHERE id = ?12",
            params![
                to_millis(&geo.timestamp),
                geo.latitude,
                geo.longitude,
                geo.altitude,
                geo.accuracy,
                geo.signal_id,
                geo.track_id,
                geo.confidence,
                geo.method,
                json_text(&geo.metadata),
                Utc::now().timestamp_millis(),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Deletes a geolocation.
    pub fn delete_geolocation(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM geolocations WHERE id = ?1", params![id])? > 0)
    }

    /// Fetches a geolocation by id.
    pub fn get_geolocation(&self, id: i64) -> Result<Option<GeolocationRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM geolocations WHERE id = ?1",
            schema::GEOLOCATION_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![id], row_to_geolocation)
            .optional()?)
    }

    fn geo_where(params: &GeoQueryParams) -> (String, Vec<Value>) {
        let mut sql = String::from(" WHERE 1=1");
        let mut values: Vec<Value> = Vec::new();
        if let Some(t) = &params.start_time {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Integer(to_millis(t)));
        }
        if let Some(t) = &params.end_time {
            sql.push_str(" AND timestamp <= ?");
            values.push(Value::Integer(to_millis(t)));
        }
        if let Some(lat) = params.min_latitude {
            sql.push_str(" AND latitude >= ?");
            values.push(Value::Real(lat));
        }
        if let Some(lat) = params.max_latitude {
            sql.push_str(" AND latitude <= ?");
            values.push(Value::Real(lat));
        }
        if let Some(lon) = params.min_longitude {
            sql.push_str(" AND longitude >= ?");
            values.push(Value::Real(lon));
        }
        if let Some(lon) = params.max_longitude {
            sql.push_str(" AND longitude <= ?");
            values.push(Value::Real(lon));
        }
        if let Some(c) = params.min_confidence {
            sql.push_str(" AND confidence >= ?");
            values.push(Value::Real(c));
        }
        if let Some(m) = &params.method {
            sql.push_str(" AND method = ?");
            values.push(Value::Text(m.clone()));
        }
        if let Some(t) = &params.track_id {
            sql.push_str(" AND track_id = ?");
            values.push(Value::Text(t.clone()));
        }
        (sql, values)
    }

    /// Queries geolocations with typed filters.
    pub fn query_geolocations(
        &self,
        params: &GeoQueryParams,
    ) -> Result<Vec<GeolocationRecord>, DbError> {
        let (where_sql, values) = Self::geo_where(params);
        let tail = order_clause(
            &params.order_by,
            params.ascending,
            params.limit,
            params.offset,
            &schema::GEOLOCATION_ORDER_COLUMNS,
        )?;
        let sql = format!(
            "SELECT {} FROM geolocations{where_sql}{tail}",
            schema::GEOLOCATION_COLUMNS
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_geolocation)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Counts the geolocations matching the filters, ignoring pagination.
    pub fn count_geolocations(&self, params: &GeoQueryParams) -> Result<u64, DbError> {
        let (where_sql, values) = Self::geo_where(params);
        let sql = format!("SELECT COUNT(*) FROM geolocations{where_sql}");
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))?;
        Ok(count as u64)
    }

    // ---- events ----

    /// Inserts an event and returns its assigned id.
    pub fn insert_event(&self, event: &EventRecord) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (timestamp, event_type, severity, source, description, \
             metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                to_millis(&event.timestamp),
                event.event_type,
                event.severity.as_str(),
                event.source,
                event.description,
                json_text(&event.metadata),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Deletes an event.
    pub fn delete_event(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM events WHERE id = ?1", params![id])? > 0)
    }

    /// Fetches an event by id.
    pub fn get_event(&self, id: i64) -> Result<Option<EventRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM events WHERE id = ?1", schema::EVENT_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_event).optional()?)
    }

    fn event_where(params: &EventQueryParams) -> (String, Vec<Value>) {
        let mut sql = String::from(" WHERE 1=1");
        let mut values: Vec<Value> = Vec::new();
        if let Some(t) = &params.start_time {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Integer(to_millis(t)));
        }
        if let Some(t) = &params.end_time {
            sql.push_str(" AND timestamp <= ?");
            values.push(Value::Integer(to_millis(t)));
        }
        if let Some(e) = &params.event_type {
            sql.push_str(" AND event_type = ?");
            values.push(Value::Text(e.clone()));
        }
        if let Some(min) = &params.min_severity {
            // The IN list is built from the enumeration, never from input.
            let names: Vec<String> = min.at_least().map(|s| format!("'{}'", s.as_str())).collect();
            sql.push_str(&format!(" AND severity IN ({})", names.join(", ")));
        }
        if let Some(s) = &params.source {
            sql.push_str(" AND source = ?");
            values.push(Value::Text(s.clone()));
        }
        if let Some(d) = &params.description_contains {
            sql.push_str(" AND description LIKE ?");
            values.push(Value::Text(format!("%{d}%")));
        }
        (sql, values)
    }

    /// Queries events with typed filters.
    pub fn query_events(&self, params: &EventQueryParams) -> Result<Vec<EventRecord>, DbError> {
        let (where_sql, values) = Self::event_where(params);
        let tail = order_clause(
            &params.order_by,
            params.ascending,
            params.limit,
            params.offset,
            &schema::EVENT_ORDER_COLUMNS,
        )?;
        let sql = format!("SELECT {} FROM events{where_sql}{tail}", schema::EVENT_COLUMNS);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Counts the events matching the filters, ignoring pagination.
    pub fn count_events(&self, params: &EventQueryParams) -> Result<u64, DbError> {
        let (where_sql, values) = Self::event_where(params);
        let sql = format!("SELECT COUNT(*) FROM events{where_sql}");
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))?;
        Ok(count as u64)
    }

    // ---- reports ----

    /// Inserts a report row and returns its assigned id.
    pub fn insert_report(&self, report: &ReportRecord) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO reports (timestamp, report_type, title, description, parameters, \
             format, file_path, created_at, created_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                to_millis(&report.timestamp),
                report.report_type,
                report.title,
                report.description,
                json_text(&report.parameters),
                report.format,
                report.file_path,
                Utc::now().timestamp_millis(),
                report.created_by,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Deletes a report row.
    pub fn delete_report(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM reports WHERE id = ?1", params![id])? > 0)
    }

    /// Fetches a report row by id.
    pub fn get_report(&self, id: i64) -> Result<Option<ReportRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM reports WHERE id = ?1",
            schema::REPORT_COLUMNS
        );
        Ok(conn.query_row(&sql, params![id], row_to_report).optional()?)
    }

    fn report_where(params: &ReportQueryParams) -> (String, Vec<Value>) {
        let mut sql = String::from(" WHERE 1=1");
        let mut values: Vec<Value> = Vec::new();
        if let Some(t) = &params.start_time {
            sql.push_str(" AND timestamp >= ?");
            values.push(Value::Integer(to_millis(t)));
        }
        if let Some(t) = &params.end_time {
            sql.push_str(" AND timestamp <= ?");
            values.push(Value::Integer(to_millis(t)));
        }
        if let Some(r) = &params.report_type {
            sql.push_str(" AND report_type = ?");
            values.push(Value::Text(r.clone()));
        }
        if let Some(t) = &params.title_contains {
            sql.push_str(" AND title LIKE ?");
            values.push(Value::Text(format!("%{t}%")));
        }
        if let Some(f) = &params.format {
            sql.push_str(" AND format = ?");
            values.push(Value::Text(f.clone()));
        }
        if let Some(c) = &params.created_by {
            sql.push_str(" AND created_by = ?");
            values.push(Value::Text(c.clone()));
        }
        (sql, values)
    }

    /// Queries report rows with typed filters.
    pub fn query_reports(
        &self,
        params: &ReportQueryParams,
    ) -> Result<Vec<ReportRecord>, DbError> {
        let (where_sql, values) = Self::report_where(params);
        let tail = order_clause(
            &params.order_by,
            params.ascending,
            params.limit,
            params.offset,
            &schema::REPORT_ORDER_COLUMNS,
        )?;
        let sql = format!(
            "SELECT {} FROM reports{where_sql}{tail}",
            schema::REPORT_COLUMNS
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_report)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Counts the report rows matching the filters, ignoring pagination.
    pub fn count_reports(&self, params: &ReportQueryParams) -> Result<u64, DbError> {
        let (where_sql, values) = Self::report_where(params);
        let sql = format!("SELECT COUNT(*) FROM reports{where_sql}");
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))?;
        Ok(count as u64)
    }

    // ---- tracks ----

    /// All signals on a track, ascending by time.
    pub fn track_signals(&self, track_id: &str) -> Result<Vec<SignalRecord>, DbError> {
        self.query_signals(&QueryParams {
            track_id: Some(track_id.to_string()),
            order_by: Some("timestamp".to_string()),
            ascending: Some(true),
            ..Default::default()
        })
    }

    /// All geolocations on a track, ascending by time.
    pub fn track_geolocations(
        &self,
        track_id: &str,
    ) -> Result<Vec<GeolocationRecord>, DbError> {
        self.query_geolocations(&GeoQueryParams {
            track_id: Some(track_id.to_string()),
            order_by: Some("timestamp".to_string()),
            ascending: Some(true),
            ..Default::default()
        })
    }

    /// Deletes every signal and geolocation row carrying the track tag.
    /// Returns the number of rows removed.
    pub fn delete_track(&self, track_id: &str) -> Result<u64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<u64, rusqlite::Error> {
            let geos = conn.execute(
                "DELETE FROM geolocations WHERE track_id = ?1",
                params![track_id],
            )?;
            let signals =
                conn.execute("DELETE FROM signals WHERE track_id = ?1", params![track_id])?;
            Ok((geos + signals) as u64)
        })();
        match result {
            Ok(count) => {
                conn.execute_batch("COMMIT")?;
                Ok(count)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }

    // ---- transactions ----

    /// Begins a transaction.
    pub fn begin(&self) -> Result<(), DbError> {
        self.conn.lock().unwrap().execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    /// Commits the open transaction.
    pub fn commit(&self) -> Result<(), DbError> {
        self.conn.lock().unwrap().execute_batch("COMMIT")?;
        Ok(())
    }

    /// Rolls back the open transaction.
    pub fn rollback(&self) -> Result<(), DbError> {
        self.conn.lock().unwrap().execute_batch("ROLLBACK")?;
        Ok(())
    }

    // ---- maintenance ----

    /// Rebuilds the database file, reclaiming free pages.
    pub fn vacuum(&self) -> Result<(), DbError> {
        self.conn.lock().unwrap().execute_batch("VACUUM")?;
        Ok(())
    }

    /// Copies the store to `path` using the online backup API, so the copy is
    /// consistent even while readers are active.
    pub fn backup(&self, path: impl AsRef<Path>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let mut dst = Connection::open(path)?;
        let backup = Backup::new(&conn, &mut dst)?;
        backup.run_to_completion(64, Duration::from_millis(50), None)?;
        Ok(())
    }

    /// Replaces the store contents from a backup at `path`. The store must be
    /// idle; the guard guarantees no reader or writer is active meanwhile.
    pub fn restore(&self, path: impl AsRef<Path>) -> Result<(), DbError> {
        let src = Connection::open(path)?;
        let mut conn = self.conn.lock().unwrap();
        {
            let backup = Backup::new(&src, &mut conn)?;
            backup.run_to_completion(64, Duration::from_millis(50), None)?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    /// Bulk-deletes rows older than `before` across all entities. Returns the
    /// number of rows removed.
    pub fn purge(&self, before: &DateTime<Utc>) -> Result<u64, DbError> {
        let cutoff = to_millis(before);
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<u64, rusqlite::Error> {
            let mut removed = 0;
            for table in ["geolocations", "signals", "events", "reports"] {
                removed += conn.execute(
                    &format!("DELETE FROM {table} WHERE timestamp < ?1"),
                    params![cutoff],
                )? as u64;
            }
            Ok(removed)
        })();
        match result {
            Ok(count) => {
                conn.execute_batch("COMMIT")?;
                Ok(count)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }

    /// Aggregate statistics over the store.
    pub fn stats(&self) -> Result<DbStats, DbError> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Result<u64, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|c| c as u64)
        };
        let (oldest, newest): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM signals",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(DbStats {
            total_signals: count("signals")?,
            total_geolocations: count("geolocations")?,
            total_events: count("events")?,
            total_reports: count("reports")?,
            db_size_bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
            oldest_record: oldest.map(from_millis),
            newest_record: newest.map(from_millis),
        })
    }

}

fn row_to_signal(row: &Row<'_>) -> rusqlite::Result<SignalRecord> {
    Ok(SignalRecord {
        id: Some(row.get(0)?),
        timestamp: from_millis(row.get(1)?),
        frequency: row.get(2)?,
        bandwidth: row.get(3)?,
        power: row.get(4)?,
        snr: row.get(5)?,
        signal_class: row.get(6)?,
        confidence: row.get(7)?,
        node_id: row.get(8)?,
        track_id: row.get(9)?,
        metadata: json_value(row.get(10)?),
        created_at: from_millis(row.get(11)?),
        updated_at: from_millis(row.get(12)?),
    })
}

fn row_to_geolocation(row: &Row<'_>) -> rusqlite::Result<GeolocationRecord> {
    Ok(GeolocationRecord {
        id: Some(row.get(0)?),
        timestamp: from_millis(row.get(1)?),
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        altitude: row.get(4)?,
        accuracy: row.get(5)?,
        signal_id: row.get(6)?,
        track_id: row.get(7)?,
        confidence: row.get(8)?,
        method: row.get(9)?,
        metadata: json_value(row.get(10)?),
        created_at: from_millis(row.get(11)?),
        updated_at: from_millis(row.get(12)?),
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: Some(row.get(0)?),
        timestamp: from_millis(row.get(1)?),
        event_type: row.get(2)?,
        severity: EventSeverity::from_str_lossy(&row.get::<_, String>(3)?),
        source: row.get(4)?,
        description: row.get(5)?,
        metadata: json_value(row.get(6)?),
        created_at: from_millis(row.get(7)?),
    })
}

fn row_to_report(row: &Row<'_>) -> rusqlite::Result<ReportRecord> {
    Ok(ReportRecord {
        id: Some(row.get(0)?),
        timestamp: from_millis(row.get(1)?),
        report_type: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        parameters: json_value(row.get(5)?),
        format: row.get(6)?,
        file_path: row.get(7)?,
        created_at: from_millis(row.get(8)?),
        created_by: row.get(9)?,
    })
}
