use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Blocks that may wait in the delivery queue before `deliver` has to wait
    pub channel_capacity: usize,
    /// How long a released buffer stays warm in the pool before it may be freed
    pub buffer_linger: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            buffer_linger: Duration::from_secs(1),
        }
    }
}

impl TransferConfig {
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_buffer_linger(mut self, linger: Duration) -> Self {
        self.buffer_linger = linger;
        self
    }
}
