//! Background rotation and health-check loops
//!
//! Two independent periodic loops, started at boot and cancelled through
//! a shared shutdown channel. Each cycle isolates per-entry failures;
//! an error escaping a cycle is logged and the loop resumes on its next
//! tick.

use crate::error::{FleetError, Result};
use crate::manager::FleetManager;
use crate::model::{FleetEntry, MIN_ROTATE_INTERVAL_MINUTES};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Grace window before hard expiry within which rotation fires
const EXPIRATION_GRACE_MINUTES: i64 = 1;

/// Connect and read deadline for a health probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(7);

/// True when the entry's upstream is at or within one minute of expiry.
/// Entries without an expiration timestamp never fire this policy.
pub fn expiration_due(entry: &FleetEntry, now: DateTime<Utc>) -> bool {
    match entry.expiration_at {
        Some(expiration) => now >= expiration - ChronoDuration::minutes(EXPIRATION_GRACE_MINUTES),
        None => false,
    }
}

/// True when the configured number of minutes has elapsed since the last
/// rotation (or creation, if never rotated). The two-minute floor is
/// enforced here as well as at settings-update time.
pub fn interval_due(entry: &FleetEntry, now: DateTime<Utc>, interval_minutes: u64) -> bool {
    let interval = interval_minutes.max(MIN_ROTATE_INTERVAL_MINUTES);
    let last = entry.last_rotated_at.unwrap_or(entry.created_at);
    now - last >= ChronoDuration::minutes(interval as i64)
}

/// Probe an endpoint end-to-end: connect, send a minimal plaintext GET,
/// and accept any response that starts talking HTTP within the read
/// deadline. Returns the elapsed time in milliseconds.
pub async fn probe_endpoint(addr: &str) -> Result<u64> {
    let started = Instant::now();

    let mut stream = match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(FleetError::Connect {
                addr: addr.to_string(),
                source: e,
            })
        }
        Err(_) => return Err(FleetError::Timeout(addr.to_string())),
    };

    let request = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n";
    stream
        .write_all(request)
        .await
        .map_err(|e| FleetError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;

    let mut buf = [0u8; 256];
    let read = tokio::time::timeout(PROBE_TIMEOUT, stream.read(&mut buf)).await;
    match read {
        Ok(Ok(n)) if buf[..n].windows(4).any(|w| w == b"HTTP") => {
            Ok(started.elapsed().as_millis() as u64)
        }
        Ok(Ok(_)) => Err(FleetError::Connect {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed probe response"),
        }),
        Ok(Err(e)) => Err(FleetError::Connect {
            addr: addr.to_string(),
            source: e,
        }),
        Err(_) => Err(FleetError::Timeout(addr.to_string())),
    }
}

/// Runs the health-check and rotation loops against the fleet manager
pub struct Scheduler {
    manager: Arc<FleetManager>,
    health_interval: Duration,
    rotation_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        manager: Arc<FleetManager>,
        health_interval: Duration,
        rotation_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            health_interval,
            rotation_interval,
            shutdown_rx,
        }
    }

    /// Spawn both loops; the returned handles finish after shutdown is
    /// signalled.
    pub fn spawn(self) -> (JoinHandle<()>, JoinHandle<()>) {
        let health = tokio::spawn(health_loop(
            Arc::clone(&self.manager),
            self.health_interval,
            self.shutdown_rx.clone(),
        ));
        let rotation = tokio::spawn(rotation_loop(
            self.manager,
            self.rotation_interval,
            self.shutdown_rx,
        ));
        (health, rotation)
    }
}

async fn health_loop(manager: Arc<FleetManager>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "Health-check loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match manager.check_all().await {
                    Ok(report) => {
                        debug!(
                            checked = report.checked,
                            healthy = report.healthy,
                            unhealthy = report.unhealthy,
                            "Health-check cycle finished"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Health-check cycle failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Health-check loop shutting down");
                    break;
                }
            }
        }
    }
}

async fn rotation_loop(manager: Arc<FleetManager>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "Rotation loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = manager.run_rotation_cycle().await {
                    error!(error = %e, "Rotation cycle failed");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Rotation loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryStatus;
    use tokio::net::TcpListener;

    fn entry_with_times(
        expiration_at: Option<DateTime<Utc>>,
        last_rotated_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> FleetEntry {
        FleetEntry {
            id: 1,
            user_id: 1,
            label: "VN-1".to_string(),
            credential: "key".to_string(),
            subdomain: "proxy1".to_string(),
            port: 9000,
            region: "random".to_string(),
            is_active: true,
            upstream: Some("1.2.3.4:8080".to_string()),
            upstream_ip: None,
            location: None,
            status: EntryStatus::Active,
            latency_ms: None,
            last_check_at: None,
            expiration_at,
            ttl: None,
            ttc: None,
            last_rotated_at,
            created_at,
        }
    }

    #[test]
    fn test_expiration_due_respects_grace_window() {
        let now = Utc::now();

        // Ninety seconds out: not yet inside the one-minute grace window
        let entry = entry_with_times(Some(now + ChronoDuration::seconds(90)), None, now);
        assert!(!expiration_due(&entry, now));

        // Thirty seconds out: due
        let entry = entry_with_times(Some(now + ChronoDuration::seconds(30)), None, now);
        assert!(expiration_due(&entry, now));

        // Already past expiry: due
        let entry = entry_with_times(Some(now - ChronoDuration::minutes(5)), None, now);
        assert!(expiration_due(&entry, now));

        // No expiration recorded: never due
        let entry = entry_with_times(None, None, now);
        assert!(!expiration_due(&entry, now));
    }

    #[test]
    fn test_interval_due_uses_last_rotation_or_creation() {
        let now = Utc::now();

        let entry = entry_with_times(None, Some(now - ChronoDuration::minutes(11)), now);
        assert!(interval_due(&entry, now, 10));

        let entry = entry_with_times(None, Some(now - ChronoDuration::minutes(9)), now);
        assert!(!interval_due(&entry, now, 10));

        // Never rotated: creation time counts
        let created = now - ChronoDuration::minutes(12);
        let entry = entry_with_times(None, None, created);
        assert!(interval_due(&entry, now, 10));
    }

    #[test]
    fn test_interval_floor_is_two_minutes() {
        let now = Utc::now();
        let entry = entry_with_times(None, Some(now - ChronoDuration::seconds(90)), now);

        // A configured interval of zero still behaves as two minutes
        assert!(!interval_due(&entry, now, 0));

        let entry = entry_with_times(None, Some(now - ChronoDuration::minutes(3)), now);
        assert!(interval_due(&entry, now, 0));
    }

    #[tokio::test]
    async fn test_probe_classifies_http_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
        });

        let latency = probe_endpoint(&addr).await.unwrap();
        assert!(latency < PROBE_TIMEOUT.as_millis() as u64);
    }

    #[tokio::test]
    async fn test_probe_rejects_non_http_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"SSH-2.0-OpenSSH\r\n").await;
        });

        assert!(probe_endpoint(&addr).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_refused_connection_is_an_error() {
        // Nothing listens on port 1 on loopback
        let err = probe_endpoint("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, FleetError::Connect { .. } | FleetError::Timeout(_)));
    }
}
