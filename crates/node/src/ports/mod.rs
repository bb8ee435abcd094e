use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no available ports in range")]
    NoPortsAvailable,
    #[error("port not allocated")]
    NotAllocated,
}

/// Record of a single port allocation. A released allocation keeps its slot
/// until the grace period elapses so the port cannot be handed out again
/// while the previous container's SSH endpoint may still hold TCP state.
#[derive(Debug, Clone)]
pub struct PortAllocation {
    pub session_id: String,
    pub allocated_at: Instant,
    pub released_at: Option<Instant>,
}

/// Hands out host SSH ports for rental containers from a fixed range.
///
/// Allocation scans the range from the bottom and returns the lowest port
/// that is either unused or past its grace period, which keeps results
/// deterministic. The range is small (hundreds to low thousands), so the
/// linear scan is fine.
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    grace_period: Duration,
    allocations: Mutex<HashMap<u16, PortAllocation>>,
}

impl PortAllocator {
    pub fn new(min_port: u16, max_port: u16, grace_period: Duration) -> Self {
        Self {
            min_port,
            max_port,
            grace_period,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves the lowest available port for the given session.
    pub fn allocate(&self, session_id: &str) -> Result<u16, PortError> {
        let mut allocations = self.allocations.lock().unwrap();
        let now = Instant::now();

        for port in self.min_port..=self.max_port {
            match allocations.get(&port) {
                None => {
                    allocations.insert(
                        port,
                        PortAllocation {
                            session_id: session_id.to_string(),
                            allocated_at: now,
                            released_at: None,
                        },
                    );
                    return Ok(port);
                }
                Some(alloc) => {
                    if alloc
                        .released_at
                        .is_some_and(|released| now.duration_since(released) >= self.grace_period)
                    {
                        allocations.insert(
                            port,
                            PortAllocation {
                                session_id: session_id.to_string(),
                                allocated_at: now,
                                released_at: None,
                            },
                        );
                        return Ok(port);
                    }
                }
            }
        }

        Err(PortError::NoPortsAvailable)
    }

    /// Marks an active allocation as released, starting the grace countdown.
    /// Releasing a port that is not actively allocated (including a second
    /// release) returns [`PortError::NotAllocated`].
    pub fn release(&self, port: u16) -> Result<(), PortError> {
        let mut allocations = self.allocations.lock().unwrap();

        match allocations.get_mut(&port) {
            Some(alloc) if alloc.released_at.is_none() => {
                alloc.released_at = Some(Instant::now());
                Ok(())
            }
            _ => Err(PortError::NotAllocated),
        }
    }

    pub fn is_available(&self, port: u16) -> bool {
        let allocations = self.allocations.lock().unwrap();

        match allocations.get(&port) {
            None => true,
            Some(alloc) => alloc
                .released_at
                .is_some_and(|released| released.elapsed() >= self.grace_period),
        }
    }

    /// Snapshot of one port's allocation record, for observability.
    pub fn allocation(&self, port: u16) -> Option<PortAllocation> {
        let allocations = self.allocations.lock().unwrap();
        allocations.get(&port).cloned()
    }

    pub fn available_count(&self) -> usize {
        let allocations = self.allocations.lock().unwrap();
        let now = Instant::now();

        (self.min_port..=self.max_port)
            .filter(|port| match allocations.get(port) {
                None => true,
                Some(alloc) => alloc
                    .released_at
                    .is_some_and(|released| now.duration_since(released) >= self.grace_period),
            })
            .count()
    }
}
