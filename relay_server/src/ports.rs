//! UDP port allocation for datagram channels.
//!
//! Ports are handed out from a bounded cycling range; a bind collision
//! moves on to the next port. Because the cursor only ever advances,
//! released ports become eligible again after the cursor wraps.

use std::sync::{Mutex, PoisonError};

use tokio::net::UdpSocket;
use tracing::debug;

/// Cycling allocator over an inclusive port range.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    cursor: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            // Seeded one below the range so the first allocation is `min`.
            cursor: Mutex::new(min.saturating_sub(1)),
        }
    }

    /// Advances the cursor and returns the next candidate port, wrapping
    /// from `max` back to `min`.
    pub fn next_port(&self) -> u16 {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        *cursor = if *cursor >= self.max {
            self.min
        } else {
            *cursor + 1
        };
        *cursor
    }

    /// Binds a UDP socket on the next free port in the range, retrying on
    /// collisions. Gives up after one full cycle of the range.
    pub async fn bind(&self) -> anyhow::Result<UdpSocket> {
        let span = usize::from(self.max - self.min) + 1;
        for _ in 0..span {
            let port = self.next_port();
            match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    debug!(port, error = %e, "udp bind failed, trying next port");
                }
            }
        }
        anyhow::bail!("udp port range {}..={} exhausted", self.min, self.max)
    }

    #[cfg(test)]
    fn set_cursor(&self, value: u16) {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_is_range_start() {
        let ports = PortAllocator::new(30001, 40000);
        assert_eq!(ports.next_port(), 30001);
        assert_eq!(ports.next_port(), 30002);
    }

    #[test]
    fn cursor_wraps_at_range_end() {
        let ports = PortAllocator::new(30001, 40000);
        ports.set_cursor(39999);
        assert_eq!(ports.next_port(), 40000);
        assert_eq!(ports.next_port(), 30001);
    }

    #[tokio::test]
    async fn bind_skips_occupied_ports() -> anyhow::Result<()> {
        let ports = PortAllocator::new(41001, 41010);
        let first = ports.bind().await?;
        let second = ports.bind().await?;
        assert_ne!(first.local_addr()?.port(), second.local_addr()?.port());

        // A fresh allocator over the same range walks past the two bound
        // ports to the next free one.
        let rebound = PortAllocator::new(41001, 41010);
        let third = rebound.bind().await?;
        assert_ne!(third.local_addr()?.port(), first.local_addr()?.port());
        assert_ne!(third.local_addr()?.port(), second.local_addr()?.port());
        Ok(())
    }
}
