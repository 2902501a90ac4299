//! Per-user traffic counters and activity tracking.
//!
//! `last_activity` uses `tokio::time::Instant` so watchdog behavior can be
//! exercised under a paused test clock.

use tokio::time::Instant;

use crate::chat::UserId;

#[derive(Debug, Clone)]
pub struct Statistics {
    user_id: UserId,
    sent_messages: u64,
    received_messages: u64,
    bytes_transferred: u64,
    connected_times: u64,
    disconnected_times: u64,
    last_activity: Instant,
}

impl Statistics {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            sent_messages: 0,
            received_messages: 0,
            bytes_transferred: 0,
            connected_times: 0,
            disconnected_times: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn add_connection(&mut self) -> &mut Self {
        self.connected_times += 1;
        self.touch()
    }

    pub fn add_disconnection(&mut self) -> &mut Self {
        self.disconnected_times += 1;
        self.touch()
    }

    pub fn add_sent_message(&mut self) -> &mut Self {
        self.sent_messages += 1;
        self.touch()
    }

    pub fn add_received_message(&mut self) -> &mut Self {
        self.received_messages += 1;
        self.touch()
    }

    pub fn add_bytes_transferred(&mut self, bytes: u64) -> &mut Self {
        self.bytes_transferred += bytes;
        self.touch()
    }

    /// Refresh the activity timestamp without touching any counter, e.g. on
    /// a pong.
    pub fn mark_active(&mut self) {
        self.touch();
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent_messages
    }

    pub fn received_messages(&self) -> u64 {
        self.received_messages
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn connected_times(&self) -> u64 {
        self.connected_times
    }

    pub fn disconnected_times(&self) -> u64 {
        self.disconnected_times
    }

    /// Seconds since the last counted activity.
    pub fn inactive_secs(&self) -> u64 {
        self.last_activity.elapsed().as_secs()
    }

    fn touch(&mut self) -> &mut Self {
        self.last_activity = Instant::now();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counters_accumulate() {
        let mut stats = Statistics::new(10);
        stats.add_connection();
        stats.add_sent_message().add_bytes_transferred(42);
        stats.add_received_message().add_bytes_transferred(8);
        stats.add_disconnection();

        assert_eq!(stats.user_id(), 10);
        assert_eq!(stats.connected_times(), 1);
        assert_eq!(stats.disconnected_times(), 1);
        assert_eq!(stats.sent_messages(), 1);
        assert_eq!(stats.received_messages(), 1);
        assert_eq!(stats.bytes_transferred(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_refreshes_on_update() {
        let mut stats = Statistics::new(10);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(stats.inactive_secs(), 30);

        stats.mark_active();
        assert_eq!(stats.inactive_secs(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        stats.add_sent_message();
        assert_eq!(stats.inactive_secs(), 0);
    }
}
