//! Resource allocation for new fleet entries
//!
//! Snapshot-based scans over the current entries; the orchestrator is
//! responsible for holding its mutation lock across allocate-and-persist
//! so two creations never observe the same snapshot.

use crate::error::{FleetError, Result};
use crate::model::FleetEntry;

/// Highest `proxyN` label ever handed out
const SUBDOMAIN_LIMIT: u32 = 999;

/// Width of the port allocation window
pub const PORT_WINDOW: u16 = 100;

/// Next entry id: 1 for an empty fleet, otherwise max + 1. Deleted ids
/// are never reused.
pub fn next_id(entries: &[FleetEntry]) -> u64 {
    entries.iter().map(|e| e.id).max().map_or(1, |max| max + 1)
}

/// First unused `proxyN` label, N in 1..=999
pub fn next_subdomain(entries: &[FleetEntry]) -> Result<String> {
    for n in 1..=SUBDOMAIN_LIMIT {
        let candidate = format!("proxy{}", n);
        if !entries.iter().any(|e| e.subdomain == candidate) {
            return Ok(candidate);
        }
    }
    Err(FleetError::ResourceExhausted("subdomains"))
}

/// First unused port in `window_start..window_start + 100`
pub fn next_port(entries: &[FleetEntry], window_start: u16) -> Result<u16> {
    for port in window_start..window_start + PORT_WINDOW {
        if !entries.iter().any(|e| e.port == port) {
            return Ok(port);
        }
    }
    Err(FleetError::ResourceExhausted("ports"))
}
