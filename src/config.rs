/// Retry budget for a [`Framer`](crate::Framer).
///
/// The meter handshake has no natural end when the device is unplugged or
/// stuck, so every loop that waits on it is capped by one of these counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Consecutive NAKed frames tolerated during a sync before giving up.
    pub max_rejects: u32,
    /// Consecutive reads during a sync that carry neither a frame nor a
    /// control code.
    pub max_idle_reads: u32,
    /// Writes per handshake phase when entering command mode.
    pub max_handshake_attempts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            // ASTM E1381 sender retry limit
            max_rejects: 6,
            max_idle_reads: 32,
            max_handshake_attempts: 16,
        }
    }
}

impl LinkConfig {
    pub fn with_max_rejects(mut self, max_rejects: u32) -> Self {
        self.max_rejects = max_rejects;
        self
    }

    pub fn with_max_idle_reads(mut self, max_idle_reads: u32) -> Self {
        self.max_idle_reads = max_idle_reads;
        self
    }

    pub fn with_max_handshake_attempts(mut self, max_handshake_attempts: u32) -> Self {
        self.max_handshake_attempts = max_handshake_attempts;
        self
    }
}
