use crate::config::ServiceDescriptor;
use crate::error::{PortConflict, PortConflictError};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use tracing::{debug, warn};

/// Pre-flight gate: every required port must be bindable before anything is spawned
#[derive(Debug, Clone)]
pub struct PortAvailabilityChecker {
    host: IpAddr,
}

impl Default for PortAvailabilityChecker {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl PortAvailabilityChecker {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }

    /// Bind and immediately release a listener on each port, collecting every conflict
    pub fn check_all(&self, descriptors: &[ServiceDescriptor]) -> Result<(), PortConflictError> {
        let mut conflicts = Vec::new();
        let mut claimed: HashMap<u16, &str> = HashMap::new();

        for descriptor in descriptors {
            if let Some(owner) = claimed.insert(descriptor.port, &descriptor.name) {
                conflicts.push(PortConflict {
                    service: descriptor.name.clone(),
                    port: descriptor.port,
                    reason: format!("port is also required by service '{owner}'"),
                });
                continue;
            }

            match TcpListener::bind((self.host, descriptor.port)) {
                Ok(listener) => {
                    drop(listener);
                    debug!(service = %descriptor.name, port = descriptor.port, "Port available");
                }
                Err(e) => {
                    warn!(service = %descriptor.name, port = descriptor.port, error = %e, "Port unavailable");
                    conflicts.push(PortConflict {
                        service: descriptor.name.clone(),
                        port: descriptor.port,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(PortConflictError { conflicts })
        }
    }
}
