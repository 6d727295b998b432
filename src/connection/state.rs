//! Connection state management.

use std::time::{Duration, Instant};

/// Connection lifecycle state.
///
/// `Pending -> Ready -> Broken` or `Pending -> Broken`; `Broken` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Dial or handshake in progress.
    #[default]
    Pending = 0,
    /// Handshake completed; usable.
    Ready = 1,
    /// Failed or closed; never reused.
    Broken = 2,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Ready,
            _ => Self::Broken,
        }
    }

    /// Check if the connection is usable.
    pub fn is_ready(&self) -> bool {
        *self == ConnectionState::Ready
    }

    /// Check if establishment is still in progress.
    pub fn is_pending(&self) -> bool {
        *self == ConnectionState::Pending
    }

    /// Check if the connection is broken.
    pub fn is_broken(&self) -> bool {
        *self == ConnectionState::Broken
    }
}

/// Connection statistics.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Number of frames sent.
    pub frames_sent: u64,
    /// Number of frames received.
    pub frames_received: u64,
    /// Number of keep-alive pings sent.
    pub pings_sent: u64,
    /// Number of keep-alive pongs received.
    pub pongs_received: u64,
    /// Time the handshake completed.
    pub connected_at: Option<Instant>,
    /// Time the connection broke.
    pub disconnected_at: Option<Instant>,
}

impl ConnectionStats {
    /// Record a completed handshake.
    pub fn record_connect(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    /// Record the transition to broken.
    pub fn record_disconnect(&mut self) {
        self.disconnected_at = Some(Instant::now());
    }

    /// Record a sent frame.
    pub fn record_send(&mut self, is_ping: bool) {
        self.frames_sent += 1;
        if is_ping {
            self.pings_sent += 1;
        }
    }

    /// Record a received frame.
    pub fn record_receive(&mut self, is_pong: bool) {
        self.frames_received += 1;
        if is_pong {
            self.pongs_received += 1;
        }
    }

    /// Time spent Ready, up to now or the disconnect.
    pub fn uptime(&self) -> Option<Duration> {
        let connected = self.connected_at?;
        Some(match self.disconnected_at {
            Some(disconnected) => disconnected.saturating_duration_since(connected),
            None => connected.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(ConnectionState::Pending.is_pending());
        assert!(ConnectionState::Broken.is_broken());
        assert_eq!(ConnectionState::default(), ConnectionState::Pending);
        assert_eq!(
            ConnectionState::from_u8(ConnectionState::Ready as u8),
            ConnectionState::Ready
        );
    }

    #[test]
    fn test_connection_stats() {
        let mut stats = ConnectionStats::default();
        assert!(stats.uptime().is_none());

        stats.record_connect();
        stats.record_send(true);
        stats.record_send(false);
        stats.record_receive(true);
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.pings_sent, 1);
        assert_eq!(stats.pongs_received, 1);

        stats.record_disconnect();
        assert!(stats.uptime().is_some());
    }
}
