//! Port reservation table.
//!
//! Claims happen before the bind so the check and the insert are one atomic
//! step under the table lock, even when two services race for a port on a
//! multi-threaded runtime.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use switchyard_core::TransportType;

use super::config::PortSharing;

/// One transport listening through a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachedTransport {
    pub transport: TransportType,
    pub label: String,
}

/// A reserved port and the transports attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortReservation {
    pub port: u16,
    pub owner: String,
    pub transports: Vec<AttachedTransport>,
}

/// Outcome of [`ReservationTable::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The port was free and now belongs to the caller, who must bind it.
    New,
    /// The caller already owns the port; the transport was attached without
    /// a new bind.
    Shared,
    /// The port is unavailable. `owner` may be the caller itself when
    /// sharing is exclusive.
    Taken { owner: String },
}

#[derive(Debug, Default)]
pub struct ReservationTable {
    ports: Mutex<BTreeMap<u16, PortReservation>>,
}

impl ReservationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `port` for `transport` of `namespace` under `sharing`.
    pub fn claim(
        &self,
        port: u16,
        namespace: &str,
        transport: TransportType,
        label: &str,
        sharing: PortSharing,
    ) -> Claim {
        let mut ports = self.ports.lock();
        let attached = AttachedTransport {
            transport,
            label: label.to_string(),
        };

        if let Some(existing) = ports.get_mut(&port) {
            if existing.owner != namespace {
                return Claim::Taken {
                    owner: existing.owner.clone(),
                };
            }
            if existing.transports.is_empty() {
                // Reserved ahead of time but never bound.
                existing.transports.push(attached);
                return Claim::New;
            }
            if sharing == PortSharing::Exclusive {
                return Claim::Taken {
                    owner: existing.owner.clone(),
                };
            }
            existing.transports.push(attached);
            return Claim::Shared;
        }

        ports.insert(
            port,
            PortReservation {
                port,
                owner: namespace.to_string(),
                transports: vec![attached],
            },
        );
        Claim::New
    }

    /// Records a port the OS assigned after a bind to port 0.
    ///
    /// Returns false when the port is already reserved.
    pub fn record(&self, port: u16, namespace: &str, transport: TransportType, label: &str) -> bool {
        let mut ports = self.ports.lock();
        if ports.contains_key(&port) {
            return false;
        }
        ports.insert(
            port,
            PortReservation {
                port,
                owner: namespace.to_string(),
                transports: vec![AttachedTransport {
                    transport,
                    label: label.to_string(),
                }],
            },
        );
        true
    }

    /// Reserves `port` for `namespace` with nothing attached yet.
    ///
    /// Succeeds when the port is free or already owned by `namespace`.
    pub fn reserve(&self, namespace: &str, port: u16) -> bool {
        let mut ports = self.ports.lock();
        match ports.get(&port) {
            Some(existing) => existing.owner == namespace,
            None => {
                ports.insert(
                    port,
                    PortReservation {
                        port,
                        owner: namespace.to_string(),
                        transports: Vec::new(),
                    },
                );
                true
            }
        }
    }

    /// Detaches one transport. The reservation goes away with its last
    /// transport; returns true in that case.
    pub fn release(&self, port: u16, transport: TransportType, label: &str) -> bool {
        let mut ports = self.ports.lock();
        let Some(existing) = ports.get_mut(&port) else {
            return false;
        };
        existing
            .transports
            .retain(|t| !(t.transport == transport && t.label == label));
        if existing.transports.is_empty() {
            ports.remove(&port);
            true
        } else {
            false
        }
    }

    /// Drops every reservation owned by `namespace`, returning the ports.
    pub fn release_namespace(&self, namespace: &str) -> Vec<u16> {
        let mut ports = self.ports.lock();
        let owned: Vec<u16> = ports
            .values()
            .filter(|r| r.owner == namespace)
            .map(|r| r.port)
            .collect();
        for port in &owned {
            ports.remove(port);
        }
        owned
    }

    #[must_use]
    pub fn is_reserved(&self, port: u16) -> bool {
        self.ports.lock().contains_key(&port)
    }

    #[must_use]
    pub fn owner(&self, port: u16) -> Option<String> {
        self.ports.lock().get(&port).map(|r| r.owner.clone())
    }

    /// Snapshot ordered by port.
    #[must_use]
    pub fn all(&self) -> Vec<PortReservation> {
        self.ports.lock().values().cloned().collect()
    }
}
