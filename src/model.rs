//! Persistent data model for the proxy fleet
//!
//! Everything in here round-trips through the flat-file store as one
//! [`FleetState`] snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Runtime status of a fleet entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Created or recovered without a usable upstream endpoint
    Pending,
    /// Forwarder registered and last probe succeeded
    Active,
    /// Last start or probe failed
    Error,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Pending => write!(f, "pending"),
            EntryStatus::Active => write!(f, "active"),
            EntryStatus::Error => write!(f, "error"),
        }
    }
}

/// One rented upstream slot exposed as a local forwarding endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEntry {
    pub id: u64,
    pub user_id: u64,
    /// Human-readable label, derived from the upstream location at creation
    pub label: String,
    /// Opaque provider key used to request and rotate the upstream endpoint
    pub credential: String,
    pub subdomain: String,
    pub port: u16,
    /// Region preference passed to the provider on rotation
    #[serde(default = "default_region")]
    pub region: String,
    /// Soft-delete flag; inactive entries are excluded from the gateway
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Upstream endpoint currently forwarded to, as "host:port"
    pub upstream: Option<String>,
    pub upstream_ip: Option<String>,
    pub location: Option<String>,
    pub status: EntryStatus,
    pub latency_ms: Option<u64>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub expiration_at: Option<DateTime<Utc>>,
    pub ttl: Option<u64>,
    pub ttc: Option<u64>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn default_region() -> String {
    "random".to_string()
}

fn default_true() -> bool {
    true
}

impl FleetEntry {
    /// Apply a freshly fetched upstream binding to this entry
    pub fn apply_upstream(&mut self, info: &UpstreamInfo) {
        self.upstream = Some(info.endpoint.clone());
        self.upstream_ip = Some(info.public_ip.clone());
        self.location = Some(info.location.clone());
        self.expiration_at = info.expiration_at();
        self.ttl = info.ttl;
        self.ttc = info.ttc;
    }
}

/// Kind of lifecycle action recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Create,
    BulkImport,
    Rotate,
    AutoRotateExpiration,
    AutoRotateInterval,
    Restart,
    Update,
    Delete,
}

impl std::fmt::Display for LogAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogAction::Create => "create",
            LogAction::BulkImport => "bulk_import",
            LogAction::Rotate => "rotate",
            LogAction::AutoRotateExpiration => "auto_rotate_expiration",
            LogAction::AutoRotateInterval => "auto_rotate_interval",
            LogAction::Restart => "restart",
            LogAction::Update => "update",
            LogAction::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a logged action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutcome {
    Success,
    Failed,
}

/// Append-only audit record; never mutated after creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationLogEntry {
    pub id: u64,
    pub entry_id: u64,
    pub action: LogAction,
    pub region: Option<String>,
    pub outcome: LogOutcome,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Process-wide rotation policy, read by the scheduler each cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    pub rotate_on_expiration: bool,
    pub rotate_on_interval: bool,
    pub rotate_interval_minutes: u64,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            rotate_on_expiration: true,
            rotate_on_interval: false,
            rotate_interval_minutes: 10,
        }
    }
}

/// Minimum accepted rotation interval in minutes
pub const MIN_ROTATE_INTERVAL_MINUTES: u64 = 2;

/// The whole persisted state, loaded and saved as one unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetState {
    #[serde(default)]
    pub settings: FleetSettings,
    #[serde(default)]
    pub entries: Vec<FleetEntry>,
    #[serde(default)]
    pub log: Vec<RotationLogEntry>,
}

impl FleetState {
    pub fn entry(&self, id: u64) -> Option<&FleetEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entry_mut(&mut self, id: u64) -> Option<&mut FleetEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Entries still included in the fleet (not soft-deleted)
    pub fn active_entries(&self) -> Vec<FleetEntry> {
        self.entries.iter().filter(|e| e.is_active).cloned().collect()
    }
}

/// Upstream endpoint description returned by the rental provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamInfo {
    /// Endpoint to forward to, as "host:port"
    #[serde(rename = "http")]
    pub endpoint: String,
    #[serde(rename = "realIpAddress")]
    pub public_ip: String,
    pub location: String,
    /// Hard expiry of the rented endpoint, epoch milliseconds
    #[serde(rename = "expirationAt")]
    pub expires_at_epoch_ms: Option<i64>,
    pub ttl: Option<u64>,
    pub ttc: Option<u64>,
}

impl UpstreamInfo {
    /// Expiration timestamp, if the provider reported one
    pub fn expiration_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at_epoch_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> FleetEntry {
        FleetEntry {
            id: 1,
            user_id: 1,
            label: "VN-1".to_string(),
            credential: "key-abcdef".to_string(),
            subdomain: "proxy1".to_string(),
            port: 9000,
            region: "random".to_string(),
            is_active: true,
            upstream: Some("1.2.3.4:8080".to_string()),
            upstream_ip: Some("1.2.3.4".to_string()),
            location: Some("VN".to_string()),
            status: EntryStatus::Active,
            latency_ms: Some(42),
            last_check_at: None,
            expiration_at: None,
            ttl: Some(60),
            ttc: Some(5),
            last_rotated_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_upstream_info_wire_names() {
        let json = r#"{
            "http": "1.2.3.4:8080",
            "realIpAddress": "1.2.3.4",
            "location": "VN",
            "expirationAt": 1700000000000,
            "ttl": 60,
            "ttc": 5
        }"#;
        let info: UpstreamInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.endpoint, "1.2.3.4:8080");
        assert_eq!(info.public_ip, "1.2.3.4");
        assert_eq!(info.location, "VN");
        assert_eq!(info.ttl, Some(60));
        let exp = info.expiration_at().unwrap();
        assert_eq!(exp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_apply_upstream_updates_binding_fields() {
        let mut entry = sample_entry();
        let info = UpstreamInfo {
            endpoint: "5.6.7.8:9090".to_string(),
            public_ip: "5.6.7.8".to_string(),
            location: "SG".to_string(),
            expires_at_epoch_ms: Some(1_700_000_000_000),
            ttl: Some(120),
            ttc: Some(3),
        };
        entry.apply_upstream(&info);
        assert_eq!(entry.upstream.as_deref(), Some("5.6.7.8:9090"));
        assert_eq!(entry.upstream_ip.as_deref(), Some("5.6.7.8"));
        assert_eq!(entry.location.as_deref(), Some("SG"));
        assert_eq!(entry.ttl, Some(120));
        assert!(entry.expiration_at.is_some());
    }

    #[test]
    fn test_state_lookup_and_active_filter() {
        let mut state = FleetState::default();
        state.entries.push(sample_entry());
        let mut second = sample_entry();
        second.id = 2;
        second.is_active = false;
        state.entries.push(second);

        assert!(state.entry(1).is_some());
        assert!(state.entry(3).is_none());
        state.entry_mut(1).unwrap().latency_ms = Some(7);
        assert_eq!(state.entry(1).unwrap().latency_ms, Some(7));

        let active = state.active_entries();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 1);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = FleetSettings::default();
        assert!(settings.rotate_on_expiration);
        assert!(!settings.rotate_on_interval);
        assert_eq!(settings.rotate_interval_minutes, 10);
    }

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(serde_json::to_string(&EntryStatus::Active).unwrap(), "\"active\"");
        assert_eq!(serde_json::to_string(&EntryStatus::Pending).unwrap(), "\"pending\"");
        let status: EntryStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(status, EntryStatus::Error);
    }
}
