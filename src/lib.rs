//! tdoa-node is the field-node core of a distributed TDOA direction-finding
//! platform. It acquires wideband I/Q from a BB60-series receiver through a
//! hardware-agnostic signal-source layer, stores detections, geolocations,
//! events and reports in an embedded signal database with query and report
//! engines, and serves offline map tiles from a local cache with a background
//! downloader and coverage analyzer. A central controller drives the node
//! over a command channel and observes it through the event bus.

#![warn(missing_docs)]

pub mod app;
pub mod args;
pub mod bus;
pub mod db;
pub mod device;
pub mod monitor;
pub mod stream;
pub mod tiles;
