//! Bounded port pool for worker processes.
//!
//! Ports are reserved per project path. A path that already holds a
//! reservation gets the same port back, so acquisition is idempotent. The
//! pool carries no lock of its own: the supervisor's lock guards it together
//! with the instance map, which keeps port state and instance state atomic.

use std::collections::HashMap;

use super::probe::HealthProbe;

/// Port reservation failures.
#[derive(Debug, PartialEq, Eq)]
pub enum PortError {
    /// Every port in the range is reserved.
    NoAvailablePort,
    /// Every port is either reserved or occupied by some other process.
    AllPortsInUse,
    /// Release of a port that holds no reservation.
    PortNotInUse,
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortError::NoAvailablePort => write!(f, "no available port in pool"),
            PortError::AllPortsInUse => {
                write!(f, "all ports in range are occupied by other services")
            }
            PortError::PortNotInUse => write!(f, "port not in use"),
        }
    }
}

/// Finite port interval with a port → project-path reservation map.
pub struct PortPool {
    min: u16,
    max: u16,
    reserved: HashMap<u16, String>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            reserved: HashMap::new(),
        }
    }

    /// Reserve the numerically first free port for `path`. Idempotent: an
    /// existing reservation for the path is returned as-is.
    ///
    /// The supervisor reserves through [`acquire_available`](Self::acquire_available);
    /// this unchecked variant is for callers that already know the port is
    /// externally free.
    #[allow(dead_code)]
    pub fn acquire(&mut self, path: &str) -> Result<u16, PortError> {
        if let Some(port) = self.port_for(path) {
            return Ok(port);
        }
        for port in self.min..=self.max {
            if !self.reserved.contains_key(&port) {
                self.reserved.insert(port, path.to_string());
                return Ok(port);
            }
        }
        Err(PortError::NoAvailablePort)
    }

    /// Like [`acquire`](Self::acquire), but skips ports the probe reports as
    /// occupied by some other process. Fails only when every candidate is
    /// reserved or externally occupied.
    pub async fn acquire_available(
        &mut self,
        path: &str,
        probe: &dyn HealthProbe,
    ) -> Result<u16, PortError> {
        if let Some(port) = self.port_for(path) {
            return Ok(port);
        }
        for port in self.min..=self.max {
            if self.reserved.contains_key(&port) {
                continue;
            }
            if probe.healthy(port).await {
                // Something else answers on this port; leave it alone.
                continue;
            }
            self.reserved.insert(port, path.to_string());
            return Ok(port);
        }
        Err(PortError::AllPortsInUse)
    }

    /// Release a reservation. Freed ports become reusable immediately.
    pub fn release(&mut self, port: u16) -> Result<(), PortError> {
        if self.reserved.remove(&port).is_none() {
            return Err(PortError::PortNotInUse);
        }
        Ok(())
    }

    /// The port currently reserved for `path`, if any.
    pub fn port_for(&self, path: &str) -> Option<u16> {
        self.reserved
            .iter()
            .find(|(_, p)| p.as_str() == path)
            .map(|(port, _)| *port)
    }

    #[allow(dead_code)]
    pub fn used(&self) -> usize {
        self.reserved.len()
    }

    #[allow(dead_code)]
    pub fn available(&self) -> usize {
        usize::from(self.max - self.min + 1) - self.reserved.len()
    }
}
