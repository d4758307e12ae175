//! Gateway dynamic routing file
//!
//! Rewrites the reverse-proxy gateway's routing table from the current
//! active fleet entries: one router and one service per entry, routing
//! `subdomain.domain` to the forwarder's port. Regeneration is
//! idempotent, and an empty active set yields a valid comment-only file.

use crate::error::{FleetError, Result};
use crate::model::FleetEntry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Serialize)]
struct RoutingFile {
    http: HttpSection,
}

#[derive(Debug, Serialize)]
struct HttpSection {
    routers: BTreeMap<String, Router>,
    services: BTreeMap<String, Service>,
}

#[derive(Debug, Serialize)]
struct Router {
    rule: String,
    service: String,
    #[serde(rename = "entryPoints")]
    entry_points: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Service {
    #[serde(rename = "loadBalancer")]
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize)]
struct LoadBalancer {
    servers: Vec<ServerUrl>,
}

#[derive(Debug, Serialize)]
struct ServerUrl {
    url: String,
}

/// Writer for the gateway's dynamic routing file
pub struct GatewayConfig {
    path: PathBuf,
    domain: String,
    backend_host: String,
}

impl GatewayConfig {
    pub fn new(path: impl AsRef<Path>, domain: impl Into<String>, backend_host: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            domain: domain.into(),
            backend_host: backend_host.into(),
        }
    }

    /// Rewrite the routing file from the given entries. Soft-deleted
    /// entries are excluded.
    pub fn regenerate(&self, entries: &[FleetEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FleetError::Gateway(format!("create {}: {}", parent.display(), e)))?;
        }

        let active: Vec<&FleetEntry> = entries.iter().filter(|e| e.is_active).collect();

        if active.is_empty() {
            std::fs::write(&self.path, "# no active fleet entries\n")
                .map_err(|e| FleetError::Gateway(format!("write {}: {}", self.path.display(), e)))?;
            info!(path = %self.path.display(), "Generated empty gateway config");
            return Ok(());
        }

        let mut routers = BTreeMap::new();
        let mut services = BTreeMap::new();

        for entry in &active {
            let service_name = format!("{}-service", entry.subdomain);
            routers.insert(
                format!("{}-router", entry.subdomain),
                Router {
                    rule: format!("Host(`{}.{}`)", entry.subdomain, self.domain),
                    service: service_name.clone(),
                    entry_points: vec!["web".to_string()],
                },
            );
            services.insert(
                service_name,
                Service {
                    load_balancer: LoadBalancer {
                        servers: vec![ServerUrl {
                            url: format!("http://{}:{}", self.backend_host, entry.port),
                        }],
                    },
                },
            );
        }

        let file = RoutingFile {
            http: HttpSection { routers, services },
        };
        let yaml = serde_yaml::to_string(&file)
            .map_err(|e| FleetError::Gateway(format!("serialize: {}", e)))?;
        std::fs::write(&self.path, yaml)
            .map_err(|e| FleetError::Gateway(format!("write {}: {}", self.path.display(), e)))?;

        info!(
            path = %self.path.display(),
            routes = active.len(),
            "Gateway config regenerated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryStatus;
    use chrono::Utc;

    fn entry(id: u64, subdomain: &str, port: u16, is_active: bool) -> FleetEntry {
        FleetEntry {
            id,
            user_id: 1,
            label: format!("VN-{}", id),
            credential: "key".to_string(),
            subdomain: subdomain.to_string(),
            port,
            region: "random".to_string(),
            is_active,
            upstream: Some("1.2.3.4:8080".to_string()),
            upstream_ip: Some("1.2.3.4".to_string()),
            location: Some("VN".to_string()),
            status: EntryStatus::Active,
            latency_ms: None,
            last_check_at: None,
            expiration_at: None,
            ttl: None,
            ttc: None,
            last_rotated_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_regenerate_writes_router_and_service() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.yml");
        let gateway = GatewayConfig::new(&path, "example.com", "backend");

        gateway
            .regenerate(&[entry(1, "proxy1", 9000, true), entry(2, "proxy2", 9001, true)])
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&content).unwrap();

        let rule = &value["http"]["routers"]["proxy1-router"]["rule"];
        assert_eq!(rule.as_str().unwrap(), "Host(`proxy1.example.com`)");

        let url = &value["http"]["services"]["proxy2-service"]["loadBalancer"]["servers"][0]["url"];
        assert_eq!(url.as_str().unwrap(), "http://backend:9001");
    }

    #[test]
    fn test_inactive_entries_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.yml");
        let gateway = GatewayConfig::new(&path, "example.com", "backend");

        gateway
            .regenerate(&[entry(1, "proxy1", 9000, true), entry(2, "proxy2", 9001, false)])
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("proxy1-router"));
        assert!(!content.contains("proxy2-router"));
    }

    #[test]
    fn test_empty_active_set_writes_comment_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.yml");
        let gateway = GatewayConfig::new(&path, "example.com", "backend");

        gateway.regenerate(&[entry(1, "proxy1", 9000, false)]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with('#'));

        // Regeneration is idempotent
        gateway.regenerate(&[]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    }
}
