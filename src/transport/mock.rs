//! Mock transport for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{OperateResult, Transport, TransportError, TransportMessage};

/// Records every send; failures are programmable.
#[derive(Default)]
pub struct MockTransport {
    sent: RwLock<Vec<TransportMessage>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    fail_always: RwLock<bool>,
    delay: RwLock<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends, then succeed.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub async fn set_fail_always(&self, fail: bool) {
        *self.fail_always.write().await = fail;
    }

    /// Hold every send for `delay` before answering.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }

    /// Number of send attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }

    pub async fn take_sent(&self) -> Vec<TransportMessage> {
        std::mem::take(&mut *self.sent.write().await)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &TransportMessage) -> OperateResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if *self.fail_always.read().await {
            return OperateResult::Failed(TransportError::Connection(
                "Mock send failure".to_string(),
            ));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return OperateResult::Failed(TransportError::Send("Mock send failure".to_string()));
        }

        self.sent.write().await.push(message.clone());
        OperateResult::Success
    }

    fn address(&self) -> String {
        "mock://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn message() -> TransportMessage {
        TransportMessage::new(BTreeMap::new(), Vec::new())
    }

    #[tokio::test]
    async fn test_mock_transport_records_sends() {
        let transport = MockTransport::new();
        assert!(transport.send(&message()).await.is_success());
        assert_eq!(transport.sent_count().await, 1);
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_fail_next() {
        let transport = MockTransport::new();
        transport.fail_next(2);

        assert!(!transport.send(&message()).await.is_success());
        assert!(!transport.send(&message()).await.is_success());
        assert!(transport.send(&message()).await.is_success());
        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.take_sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_fail_always() {
        let transport = MockTransport::new();
        transport.set_fail_always(true).await;
        assert!(!transport.send(&message()).await.is_success());
        assert_eq!(transport.sent_count().await, 0);
    }
}
