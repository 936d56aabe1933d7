use std::collections::{HashSet, VecDeque};
use std::ops::Range;

use crate::error::BrokerError;

/// FIFO pool of ports from a single range.
///
/// A port is owned by exactly one holder between `acquire` and `release`.
/// Releasing a port that is not currently leased is refused, so a double
/// release cannot hand the same port to two holders.
#[derive(Debug)]
pub struct PortPool {
    name: &'static str,
    free: VecDeque<u16>,
    leased: HashSet<u16>,
}

impl PortPool {
    pub fn new(name: &'static str, range: Range<u16>) -> Self {
        Self {
            name,
            free: range.collect(),
            leased: HashSet::new(),
        }
    }

    /// Take the port at the head of the pool.
    pub fn acquire(&mut self) -> Result<u16, BrokerError> {
        let port = self
            .free
            .pop_front()
            .ok_or(BrokerError::ExhaustedPool { pool: self.name })?;
        self.leased.insert(port);
        Ok(port)
    }

    /// Return a leased port to the tail of the pool.
    ///
    /// Returns `false` (and leaves the pool unchanged) if `port` was not leased.
    pub fn release(&mut self, port: u16) -> bool {
        if !self.leased.remove(&port) {
            tracing::warn!(pool = self.name, port, "release of a port that is not leased");
            return false;
        }
        self.free.push_back(port);
        true
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn leased(&self) -> usize {
        self.leased.len()
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.contains(&port)
    }
}

/// The two disjoint port pools the broker hands out.
#[derive(Debug)]
pub struct PortAllocator {
    /// Private request/reply channels, one per registered peer.
    pub request: PortPool,
    /// Survey channels, one per synchronous run.
    pub survey: PortPool,
}

impl PortAllocator {
    pub fn new(request: Range<u16>, survey: Range<u16>) -> Self {
        Self {
            request: PortPool::new("request", request),
            survey: PortPool::new("survey", survey),
        }
    }
}
