//! Templated report engine.
//!
//! Reports are assembled from named sections driven by the query facade,
//! concatenated and passed through a format stage, then exported to disk.
//! Schedules re-run templates periodically over the trailing interval;
//! failures are logged and retried at the next tick without advancing the
//! schedule.

use crate::db::query::{FrequencyRange, Pagination, QueryInterface, TimeRange};
use crate::db::DbError;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Report output formats.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ReportFormat {
    /// Comma separated values. Currently a textual pass-through.
    Csv,
    /// JSON. Currently a textual pass-through.
    Json,
    /// KML wrapped in a fixed document envelope.
    Kml,
    /// PDF. Declared but not supported; export fails.
    Pdf,
}

impl ReportFormat {
    /// Format name as stored and displayed.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Csv => "CSV",
            ReportFormat::Json => "JSON",
            ReportFormat::Kml => "KML",
            ReportFormat::Pdf => "PDF",
        }
    }
}

/// Whether a template parameter must be supplied.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParameterRequirement {
    /// Generation fails when the parameter is missing.
    Required,
    /// The parameter is consumed when present.
    Optional,
}

/// A named report template.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportTemplate {
    /// Template name; the key for generation and scheduling.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Section names, rendered in order.
    pub sections: Vec<String>,
    /// Parameter requirements checked against the generation options.
    pub parameters: HashMap<String, ParameterRequirement>,
    /// Formats this template may be exported to.
    pub supported_formats: Vec<ReportFormat>,
}

/// A recurring report schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSchedule {
    /// Template to run.
    pub report_name: String,
    /// Next time the report is due.
    pub next_run: DateTime<Utc>,
    /// Interval between runs; also the report's trailing time window.
    pub interval: Duration,
    /// Disabled schedules are skipped without advancing.
    pub enabled: bool,
    /// Export format.
    pub format: ReportFormat,
    /// Where the export is written.
    pub output_path: PathBuf,
    /// Custom parameters passed to generation.
    pub parameters: HashMap<String, String>,
}

/// Options for one report generation.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    /// Requested format; must be supported by the template.
    pub format: ReportFormat,
    /// Time window the sections cover.
    pub time_range: Option<TimeRange>,
    /// Restrict signal sections to one node.
    pub node_id: Option<String>,
    /// Track for the tracking summary section.
    pub track_id: Option<String>,
    /// Frequency window for the frequency analysis section.
    pub freq_range: Option<FrequencyRange>,
    /// Custom parameters checked against the template requirements.
    pub custom_parameters: HashMap<String, String>,
}

impl Default for ReportOptions {
    fn default() -> ReportOptions {
        ReportOptions {
            format: ReportFormat::Csv,
            time_range: None,
            node_id: None,
            track_id: None,
            freq_range: None,
            custom_parameters: HashMap::new(),
        }
    }
}

/// Errors returned by the report engine.
#[derive(Error, Debug)]
pub enum ReportError {
    /// The template name is not registered.
    #[error("template not found: {0}")]
    UnknownTemplate(String),
    /// The schedule name is not registered.
    #[error("schedule not found: {0}")]
    UnknownSchedule(String),
    /// The requested format is not in the template's supported set, or is
    /// PDF, which is declared but unsupported.
    #[error("unsupported report format: {0}")]
    UnsupportedFormat(&'static str),
    /// A required custom parameter is missing from the options.
    #[error("missing required parameter: {0}")]
    MissingParameter(String),
    /// The template or schedule failed validation.
    #[error("invalid report definition: {0}")]
    Invalid(&'static str),
    /// A query behind a section failed.
    #[error(transparent)]
    Db(#[from] DbError),
    /// The export file could not be written.
    #[error("report export failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed bin width of the frequency analysis section.
const FREQUENCY_ANALYSIS_BIN: f64 = 1.0e6;

/// Events shown by the event summary section.
const EVENT_SUMMARY_LIMIT: u64 = 100;

/// Templated report generator and scheduler.
pub struct ReportGenerator {
    query: QueryInterface,
    templates: HashMap<String, ReportTemplate>,
    schedules: HashMap<String, ReportSchedule>,
}

impl std::fmt::Debug for ReportGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportGenerator")
            .field("templates", &self.templates.len())
            .field("schedules", &self.schedules.len())
            .finish()
    }
}

impl ReportGenerator {
    /// Creates a generator over the query facade.
    pub fn new(query: QueryInterface) -> ReportGenerator {
        ReportGenerator {
            query,
            templates: HashMap::new(),
            schedules: HashMap::new(),
        }
    }

    // ---- templates ----

    /// Registers (or replaces) a template.
    pub fn register_template(&mut self, template: ReportTemplate) -> Result<(), ReportError> {
        if template.name.is_empty() {
            return Err(ReportError::Invalid("template name cannot be empty"));
        }
        if template.sections.is_empty() {
            return Err(ReportError::Invalid("template must have at least one section"));
        }
        if template.supported_formats.is_empty() {
            return Err(ReportError::Invalid(
                "template must support at least one format",
            ));
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Removes a template.
    pub fn remove_template(&mut self, name: &str) -> Result<(), ReportError> {
        self.templates
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ReportError::UnknownTemplate(name.to_string()))
    }

    /// Fetches a template by name.
    pub fn template(&self, name: &str) -> Option<&ReportTemplate> {
        self.templates.get(name)
    }

    /// Lists the registered templates.
    pub fn list_templates(&self) -> Vec<&ReportTemplate> {
        let mut templates: Vec<_> = self.templates.values().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    // ---- schedules ----

    /// Registers (or replaces) a schedule.
    pub fn schedule_report(&mut self, schedule: ReportSchedule) -> Result<(), ReportError> {
        Self::validate_schedule(&schedule)?;
        self.schedules.insert(schedule.report_name.clone(), schedule);
        Ok(())
    }

    /// Replaces an existing schedule.
    pub fn update_schedule(
        &mut self,
        name: &str,
        schedule: ReportSchedule,
    ) -> Result<(), ReportError> {
        if !self.schedules.contains_key(name) {
            return Err(ReportError::UnknownSchedule(name.to_string()));
        }
        Self::validate_schedule(&schedule)?;
        self.schedules.remove(name);
        self.schedules.insert(schedule.report_name.clone(), schedule);
        Ok(())
    }

    /// Removes a schedule.
    pub fn remove_schedule(&mut self, name: &str) -> Result<(), ReportError> {
        self.schedules
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ReportError::UnknownSchedule(name.to_string()))
    }

    /// Lists the registered schedules.
    pub fn list_schedules(&self) -> Vec<&ReportSchedule> {
        let mut schedules: Vec<_> = self.schedules.values().collect();
        schedules.sort_by(|a, b| a.report_name.cmp(&b.report_name));
        schedules
    }

    /// Enables or disables a schedule.
    pub fn enable_schedule(&mut self, name: &str, enabled: bool) -> Result<(), ReportError> {
        self.schedules
            .get_mut(name)
            .map(|s| s.enabled = enabled)
            .ok_or_else(|| ReportError::UnknownSchedule(name.to_string()))
    }

    fn validate_schedule(schedule: &ReportSchedule) -> Result<(), ReportError> {
        if schedule.report_name.is_empty() {
            return Err(ReportError::Invalid("schedule report name cannot be empty"));
        }
        if schedule.interval <= Duration::zero() {
            return Err(ReportError::Invalid("schedule interval must be positive"));
        }
        if schedule.output_path.as_os_str().is_empty() {
            return Err(ReportError::Invalid("schedule output path cannot be empty"));
        }
        Ok(())
    }

    // ---- generation ----

    /// Generates a report from a template.
    ///
    /// Resolves the template, validates the options against it, renders each
    /// section in order and joins them with single newlines, then runs the
    /// result through the format stage.
    pub fn generate_report(
        &self,
        template_name: &str,
        options: &ReportOptions,
    ) -> Result<String, ReportError> {
        let template = self
            .templates
            .get(template_name)
            .ok_or_else(|| ReportError::UnknownTemplate(template_name.to_string()))?;
        self.validate_options(template, options)?;
        let mut sections = Vec::with_capacity(template.sections.len());
        for section in &template.sections {
            sections.push(self.render_section(section, options)?);
        }
        let report = sections.join("\n");
        Ok(Self::format_report_data(report, options.format))
    }

    fn validate_options(
        &self,
        template: &ReportTemplate,
        options: &ReportOptions,
    ) -> Result<(), ReportError> {
        if !template.supported_formats.contains(&options.format) {
            return Err(ReportError::UnsupportedFormat(options.format.as_str()));
        }
        for (name, requirement) in &template.parameters {
            if *requirement == ParameterRequirement::Required
                && !options.custom_parameters.contains_key(name)
            {
                return Err(ReportError::MissingParameter(name.clone()));
            }
        }
        Ok(())
    }

    fn render_section(
        &self,
        section: &str,
        options: &ReportOptions,
    ) -> Result<String, ReportError> {
        match section {
            "signal_summary" => self.signal_summary(options),
            "tracking_summary" => self.tracking_summary(options),
            "geolocation_summary" => self.geolocation_summary(options),
            "frequency_analysis" => self.frequency_analysis(options),
            "event_summary" => self.event_summary(options),
            other => {
                tracing::warn!(section = other, "unknown report section skipped");
                Ok(String::new())
            }
        }
    }

    fn signal_summary(&self, options: &ReportOptions) -> Result<String, ReportError> {
        let stats = self
            .query
            .signal_statistics(options.time_range.as_ref(), options.node_id.as_deref())?;
        let mut out = String::new();
        let _ = writeln!(out, "Signal Summary");
        let _ = writeln!(out, "-------------");
        let _ = writeln!(out, "Total Signals: {}", stats.total_signals);
        let _ = writeln!(
            out,
            "Frequency Range: {:.0} - {:.0} Hz",
            stats.min_frequency, stats.max_frequency
        );
        let _ = writeln!(out, "Average Power: {:.2} dBm", stats.avg_power);
        let _ = writeln!(out, "Average SNR: {:.2} dB", stats.avg_snr);
        let _ = writeln!(out);
        let _ = writeln!(out, "Signal Classes:");
        let mut classes: Vec<_> = stats.signals_by_class.iter().collect();
        classes.sort();
        for (class, count) in classes {
            let _ = writeln!(out, "  {class}: {count}");
        }
        Ok(out)
    }

    fn tracking_summary(&self, options: &ReportOptions) -> Result<String, ReportError> {
        let Some(track_id) = &options.track_id else {
            return Ok("No track specified for tracking summary.\n".to_string());
        };
        let history = self
            .query
            .track_history(track_id, options.time_range.as_ref())?;
        let path = self.query.track_path(track_id, options.time_range.as_ref())?;
        let mut out = String::new();
        let _ = writeln!(out, "Track Summary: {track_id}");
        let _ = writeln!(out, "--------------");
        let _ = writeln!(out, "Total Points: {}", history.len());
        let _ = writeln!(out, "Geolocations: {}", path.len());
        let _ = writeln!(out);
        let _ = writeln!(out, "Signal History:");
        for signal in &history {
            let _ = writeln!(
                out,
                "  Time: {}, Freq: {:.0} Hz, Power: {:.2} dBm, SNR: {:.2} dB",
                signal.timestamp.timestamp(),
                signal.frequency,
                signal.power,
                signal.snr
            );
        }
        Ok(out)
    }

    fn geolocation_summary(&self, options: &ReportOptions) -> Result<String, ReportError> {
        let stats = self
            .query
            .geolocation_statistics(options.time_range.as_ref(), None)?;
        let mut out = String::new();
        let _ = writeln!(out, "Geolocation Summary");
        let _ = writeln!(out, "-------------------");
        let _ = writeln!(out, "Total Locations: {}", stats.total_locations);
        let _ = writeln!(out, "Average Confidence: {:.2}", stats.avg_confidence);
        let _ = writeln!(out, "Coverage Area:");
        let _ = writeln!(
            out,
            "  Latitude: {:.4} to {:.4}",
            stats.coverage_area.min_latitude, stats.coverage_area.max_latitude
        );
        let _ = writeln!(
            out,
            "  Longitude: {:.4} to {:.4}",
            stats.coverage_area.min_longitude, stats.coverage_area.max_longitude
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "Methods Used:");
        let mut methods: Vec<_> = stats.locations_by_method.iter().collect();
        methods.sort();
        for (method, count) in methods {
            let _ = writeln!(out, "  {method}: {count}");
        }
        Ok(out)
    }

    fn frequency_analysis(&self, options: &ReportOptions) -> Result<String, ReportError> {
        let Some(range) = &options.freq_range else {
            return Ok("No frequency range specified for analysis.\n".to_string());
        };
        let bins =
            self.query
                .frequency_density(range, FREQUENCY_ANALYSIS_BIN, options.time_range.as_ref())?;
        let mut out = String::new();
        let _ = writeln!(out, "Frequency Analysis");
        let _ = writeln!(out, "------------------");
        let _ = writeln!(out, "Range: {:.0} - {:.0} Hz", range.min, range.max);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:>14} | {:>6} | {:>12} | {:>8}",
            "Freq (Hz)", "Count", "Avg Power", "Avg SNR"
        );
        let _ = writeln!(out, "{}", "-".repeat(50));
        for bin in &bins {
            let _ = writeln!(
                out,
                "{:>14.0} | {:>6} | {:>12.2} | {:>8.2}",
                bin.frequency, bin.signal_count, bin.avg_power, bin.avg_snr
            );
        }
        Ok(out)
    }

    fn event_summary(&self, options: &ReportOptions) -> Result<String, ReportError> {
        let events = self.query.search_events(
            options.time_range.as_ref(),
            None,
            None,
            None,
            &Pagination {
                page_size: EVENT_SUMMARY_LIMIT,
                ascending: false,
                ..Default::default()
            },
        )?;
        let mut out = String::new();
        let _ = writeln!(out, "Event Summary");
        let _ = writeln!(out, "-------------");
        let _ = writeln!(out, "Total Events: {}", events.total_count);
        let _ = writeln!(out);
        let _ = writeln!(out, "Recent Events:");
        for event in &events.items {
            let _ = writeln!(
                out,
                "  [{}] {} ({}): {}",
                event.timestamp.timestamp(),
                event.event_type,
                event.severity.as_str(),
                event.description
            );
        }
        Ok(out)
    }

    /// Format stage for assembled report data.
    ///
    /// Currently a pass-through for every format; the textual representation
    /// is the contract for CSV and JSON, and KML content is wrapped at export
    /// time.
    fn format_report_data(report: String, _format: ReportFormat) -> String {
        report
    }

    // ---- export ----

    /// Exports report data in the given format.
    pub fn export(
        &self,
        report: &str,
        format: ReportFormat,
        path: &Path,
    ) -> Result<(), ReportError> {
        match format {
            ReportFormat::Csv | ReportFormat::Json => Ok(std::fs::write(path, report)?),
            ReportFormat::Kml => {
                let wrapped = format!(
                    "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
                     <kml xmlns=\"http://www.opengis.net/kml/2.2\">\n\
                     <Document>\n\
                     <name>Signal Detection Report</name>\n\
                     {report}\
                     </Document>\n\
                     </kml>"
                );
                Ok(std::fs::write(path, wrapped)?)
            }
            ReportFormat::Pdf => Err(ReportError::UnsupportedFormat("PDF")),
        }
    }

    // ---- scheduling ----

    /// Schedules that are enabled and due at `now`.
    pub fn due_reports(&self, now: DateTime<Utc>) -> Vec<&ReportSchedule> {
        let mut due: Vec<_> = self
            .schedules
            .values()
            .filter(|s| s.enabled && s.next_run <= now)
            .collect();
        due.sort_by(|a, b| a.report_name.cmp(&b.report_name));
        due
    }

    /// Runs every due schedule.
    ///
    /// Each due report is generated over the trailing interval and exported;
    /// on success the schedule advances to `now + interval`. Failures are
    /// logged and the schedule is retried at the next tick.
    pub fn process_due_reports(&mut self, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .due_reports(now)
            .into_iter()
            .map(|s| s.report_name.clone())
            .collect();
        for name in due {
            let Some(schedule) = self.schedules.get(&name).cloned() else {
                continue;
            };
            let options = ReportOptions {
                format: schedule.format,
                time_range: Some(TimeRange {
                    start: now - schedule.interval,
                    end: now,
                }),
                custom_parameters: schedule.parameters.clone(),
                ..Default::default()
            };
            let result = self
                .generate_report(&name, &options)
                .and_then(|report| self.export(&report, schedule.format, &schedule.output_path));
            match result {
                Ok(()) => {
                    if let Some(schedule) = self.schedules.get_mut(&name) {
                        schedule.next_run = now + schedule.interval;
                    }
                    tracing::info!(report = %name, "scheduled report written");
                }
                Err(error) => {
                    tracing::warn!(report = %name, %error, "scheduled report failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::testutil::{geolocation, open_db, signal};
    use crate::db::EventRecord;
    use crate::db::EventSeverity;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn generator(dir: &tempfile::TempDir) -> ReportGenerator {
        ReportGenerator::new(QueryInterface::new(Arc::new(open_db(dir))))
    }

    fn daily_summary() -> ReportTemplate {
        ReportTemplate {
            name: "daily_summary".to_string(),
            description: "Daily signal activity".to_string(),
            sections: vec![
                "signal_summary".to_string(),
                "geolocation_summary".to_string(),
                "frequency_analysis".to_string(),
                "event_summary".to_string(),
            ],
            parameters: HashMap::from([(
                "time_range".to_string(),
                ParameterRequirement::Required,
            )]),
            supported_formats: vec![ReportFormat::Json, ReportFormat::Csv, ReportFormat::Kml],
        }
    }

    fn populate(generator: &ReportGenerator) {
        let db = generator.query.db();
        let id = db
            .insert_signal(&signal(0, 145.5e6, "node001", Some("T1")))
            .unwrap();
        db.insert_signal(&signal(10, 146.2e6, "node002", Some("T1")))
            .unwrap();
        db.insert_geolocation(&geolocation(1, id, Some("T1"))).unwrap();
        db.insert_event(&EventRecord {
            id: None,
            timestamp: Utc.timestamp_opt(1_700_000_005, 0).unwrap(),
            event_type: "detection".to_string(),
            severity: EventSeverity::Info,
            source: "node001".to_string(),
            description: "new track".to_string(),
            metadata: None,
            created_at: Utc::now(),
        })
        .unwrap();
    }

    fn options() -> ReportOptions {
        ReportOptions {
            format: ReportFormat::Json,
            time_range: Some(TimeRange {
                start: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
                end: Utc.timestamp_opt(1_800_000_000, 0).unwrap(),
            }),
            freq_range: Some(FrequencyRange {
                min: 100.0e6,
                max: 200.0e6,
            }),
            custom_parameters: HashMap::from([("time_range".to_string(), "24h".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn template_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir);
        let mut template = daily_summary();
        template.name = String::new();
        assert!(generator.register_template(template).is_err());
        let mut template = daily_summary();
        template.sections.clear();
        assert!(generator.register_template(template).is_err());
        let mut template = daily_summary();
        template.supported_formats.clear();
        assert!(generator.register_template(template).is_err());
        generator.register_template(daily_summary()).unwrap();
        assert_eq!(generator.list_templates().len(), 1);
        generator.remove_template("daily_summary").unwrap();
        assert!(generator.remove_template("daily_summary").is_err());
    }

    #[test]
    fn generates_report_with_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir);
        populate(&generator);
        generator.register_template(daily_summary()).unwrap();
        let report = generator.generate_report("daily_summary", &options()).unwrap();
        assert!(!report.is_empty());
        assert!(report.starts_with("Signal Summary"));
        assert!(report.contains("Geolocation Summary"));
        assert!(report.contains("Frequency Analysis"));
        assert!(report.contains("Event Summary"));
        assert!(report.contains("Total Signals: 2"));
        assert!(report.contains("TDOA: 1"));
    }

    #[test]
    fn rejects_unsupported_format_and_missing_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir);
        let mut template = daily_summary();
        template.supported_formats = vec![ReportFormat::Csv];
        generator.register_template(template).unwrap();
        let mut bad_format = options();
        bad_format.format = ReportFormat::Json;
        assert!(matches!(
            generator.generate_report("daily_summary", &bad_format),
            Err(ReportError::UnsupportedFormat(_))
        ));
        let mut missing = options();
        missing.format = ReportFormat::Csv;
        missing.custom_parameters.clear();
        assert!(matches!(
            generator.generate_report("daily_summary", &missing),
            Err(ReportError::MissingParameter(_))
        ));
        assert!(matches!(
            generator.generate_report("nope", &options()),
            Err(ReportError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn tracking_summary_requires_track() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir);
        populate(&generator);
        generator
            .register_template(ReportTemplate {
                name: "tracking".to_string(),
                description: String::new(),
                sections: vec!["tracking_summary".to_string()],
                parameters: HashMap::new(),
                supported_formats: vec![ReportFormat::Csv],
            })
            .unwrap();
        let without_track = generator
            .generate_report("tracking", &ReportOptions::default())
            .unwrap();
        assert!(without_track.contains("No track specified"));
        let with_track = generator
            .generate_report(
                "tracking",
                &ReportOptions {
                    track_id: Some("T1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(with_track.contains("Track Summary: T1"));
        assert!(with_track.contains("Total Points: 2"));
    }

    #[test]
    fn kml_export_wraps_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir);
        let path = dir.path().join("out.kml");
        generator
            .export("<Placemark/>\n", ReportFormat::Kml, &path)
            .unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(written.contains("<name>Signal Detection Report</name>"));
        assert!(written.contains("<Placemark/>"));
        assert!(written.trim_end().ends_with("</kml>"));
    }

    #[test]
    fn pdf_export_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir);
        let path = dir.path().join("out.pdf");
        assert!(matches!(
            generator.export("data", ReportFormat::Pdf, &path),
            Err(ReportError::UnsupportedFormat("PDF"))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn csv_and_json_export_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir);
        for (format, name) in [(ReportFormat::Csv, "out.csv"), (ReportFormat::Json, "out.json")] {
            let path = dir.path().join(name);
            generator.export("line one\nline two\n", format, &path).unwrap();
            assert_eq!(
                std::fs::read_to_string(&path).unwrap(),
                "line one\nline two\n"
            );
        }
    }

    #[test]
    fn schedule_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir);
        let schedule = ReportSchedule {
            report_name: "daily_summary".to_string(),
            next_run: Utc::now(),
            interval: Duration::hours(24),
            enabled: true,
            format: ReportFormat::Csv,
            output_path: dir.path().join("daily.csv"),
            parameters: HashMap::new(),
        };
        let mut bad = schedule.clone();
        bad.interval = Duration::zero();
        assert!(generator.schedule_report(bad).is_err());
        let mut bad = schedule.clone();
        bad.output_path = PathBuf::new();
        assert!(generator.schedule_report(bad).is_err());
        generator.schedule_report(schedule).unwrap();
        assert_eq!(generator.list_schedules().len(), 1);
        generator.enable_schedule("daily_summary", false).unwrap();
        assert!(!generator.list_schedules()[0].enabled);
        assert!(generator.enable_schedule("nope", true).is_err());
    }

    #[test]
    fn due_reports_run_and_advance() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir);
        populate(&generator);
        let mut template = daily_summary();
        template.parameters.clear();
        generator.register_template(template).unwrap();
        let now = Utc.timestamp_opt(1_700_001_000, 0).unwrap();
        let output = dir.path().join("daily.csv");
        generator
            .schedule_report(ReportSchedule {
                report_name: "daily_summary".to_string(),
                next_run: now - Duration::minutes(5),
                enabled: true,
                interval: Duration::hours(24),
                format: ReportFormat::Csv,
                output_path: output.clone(),
                parameters: HashMap::new(),
            })
            .unwrap();
        assert_eq!(generator.due_reports(now).len(), 1);
        generator.process_due_reports(now);
        assert!(output.exists());
        let schedule = generator.list_schedules()[0];
        assert_eq!(schedule.next_run, now + Duration::hours(24));
        assert!(generator.due_reports(now).is_empty());
    }

    #[test]
    fn failed_schedule_does_not_advance() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir);
        // No template registered, so generation fails.
        let now = Utc::now();
        let next_run = now - Duration::minutes(1);
        generator
            .schedule_report(ReportSchedule {
                report_name: "missing_template".to_string(),
                next_run,
                enabled: true,
                interval: Duration::hours(1),
                format: ReportFormat::Csv,
                output_path: dir.path().join("never.csv"),
                parameters: HashMap::new(),
            })
            .unwrap();
        generator.process_due_reports(now);
        assert_eq!(generator.list_schedules()[0].next_run, next_run);
    }

    #[test]
    fn disabled_schedules_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut generator = generator(&dir);
        let now = Utc::now();
        generator
            .schedule_report(ReportSchedule {
                report_name: "daily_summary".to_string(),
                next_run: now - Duration::minutes(1),
                enabled: false,
                interval: Duration::hours(1),
                format: ReportFormat::Csv,
                output_path: dir.path().join("skipped.csv"),
                parameters: HashMap::new(),
            })
            .unwrap();
        assert!(generator.due_reports(now).is_empty());
    }
}
