//! Event bus and command channel.
//!
//! The in-process surface toward the external collaborators: configuration
//! changes and node metrics flow outward as broadcast events, and the central
//! controller drives maintenance through the command channel. Neither side
//! shares state with the store; everything crosses as values.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc};

/// Default broadcast capacity; slow subscribers lose the oldest events.
pub const EVENT_BUS_CAPACITY: usize = 64;

/// Events published on the node bus.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    /// A configuration value changed at the external config manager.
    ConfigChanged(tdoa_json::ConfigChangeEvent),
    /// Periodic node metrics push for the external monitor.
    Metrics(tdoa_json::NodeMetrics),
}

/// Commands accepted from the central controller.
#[derive(Debug, Clone)]
pub enum NodeCommand {
    /// Generate a report from a registered template and export it.
    GenerateReport {
        /// Template name.
        template: String,
        /// Export format.
        format: crate::db::report::ReportFormat,
        /// Where to write the export.
        output_path: PathBuf,
    },
    /// Remove cached tiles, optionally only those older than the cutoff.
    ClearTileCache {
        /// Cutoff; `None` clears everything.
        older_than: Option<SystemTime>,
    },
    /// Bulk-delete database rows older than the cutoff.
    PurgeDatabase {
        /// Deletion cutoff.
        before: DateTime<Utc>,
    },
    /// Rebuild the database file.
    VacuumDatabase,
}

/// Broadcast event bus.
///
/// Cheaply clonable; clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PlatformEvent>,
}

impl Default for EventBus {
    fn default() -> EventBus {
        EventBus::new()
    }
}

impl EventBus {
    /// Creates a bus with the default capacity.
    pub fn new() -> EventBus {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        EventBus { sender }
    }

    /// Publishes an event. Delivery to nobody is not an error; there might
    /// be no subscriber at this moment.
    pub fn publish(&self, event: PlatformEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribes to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Creates the controller command channel.
pub fn command_channel(capacity: usize) -> (mpsc::Sender<NodeCommand>, mpsc::Receiver<NodeCommand>) {
    mpsc::channel(capacity)
}
