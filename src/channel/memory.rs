//! In-memory channel for embedding and tests.
//!
//! Models a single broker queue with a ready list and an unacknowledged set
//! keyed by delivery tag, so acknowledge/reject/requeue behave like they do
//! against a real broker. `InMemoryChannelFactory` plays the direct exchange:
//! it owns the queues and routes published messages by topic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    ChannelBinding, ChannelError, ChannelFactory, MessageChannel, MessageProducer,
    ReceiveOutcome, Result,
};
use crate::broker::BrokerError;
use crate::message::Message;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    next_tag: u64,
    acknowledged: usize,
    requeued: usize,
    dead_letters: Vec<Message>,
    pending_failure: Option<BrokerError>,
    closed: bool,
}

/// One queue held in process memory.
pub struct InMemoryChannel {
    binding: ChannelBinding,
    state: Mutex<QueueState>,
    arrivals: Notify,
}

impl InMemoryChannel {
    pub fn new(binding: ChannelBinding) -> Self {
        Self {
            binding,
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
        }
    }

    /// Messages waiting to be delivered.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages delivered but not yet acknowledged, rejected or requeued.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Nothing waiting and nothing in flight.
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.ready.is_empty() && state.unacked.is_empty()
    }

    pub fn acknowledged_count(&self) -> usize {
        self.lock().acknowledged
    }

    pub fn requeued_count(&self) -> usize {
        self.lock().requeued
    }

    /// Messages rejected without requeue, in rejection order.
    pub fn dead_letters(&self) -> Vec<Message> {
        self.lock().dead_letters.clone()
    }

    /// Make the next receive report the channel as lost with `error`.
    pub fn fail_next_receive(&self, error: BrokerError) {
        self.lock().pending_failure = Some(error);
        self.arrivals.notify_waiters();
    }

    fn enqueue(&self, message: Message) {
        self.lock().ready.push_back(message);
        self.arrivals.notify_one();
    }

    fn take_unacked(state: &mut QueueState, message: &Message) -> Result<Message> {
        let tag = message
            .delivery_tag()
            .ok_or(ChannelError::NotDelivered(message.id()))?;
        state.unacked.remove(&tag).ok_or_else(|| {
            ChannelError::Failure(BrokerError::Protocol(format!(
                "unknown delivery tag {tag}"
            )))
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageProducer for InMemoryChannel {
    async fn send(&self, message: &Message) -> Result<()> {
        if self.lock().closed {
            return Err(ChannelError::Closed(self.binding.queue.clone()));
        }
        self.enqueue(message.detached());
        Ok(())
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    async fn receive(&self, timeout: Duration) -> ReceiveOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut state = self.lock();
                if let Some(error) = state.pending_failure.take() {
                    return ReceiveOutcome::ChannelLost(ChannelError::Failure(error));
                }
                if state.closed {
                    return ReceiveOutcome::ChannelLost(ChannelError::Closed(
                        self.binding.queue.clone(),
                    ));
                }
                if let Some(message) = state.ready.pop_front() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let message = message.with_delivery_tag(tag);
                    state.unacked.insert(tag, message.clone());
                    return ReceiveOutcome::Delivered(message);
                }
            }

            if tokio::time::timeout_at(deadline, self.arrivals.notified())
                .await
                .is_err()
            {
                return ReceiveOutcome::TimedOut;
            }
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        let mut state = self.lock();
        Self::take_unacked(&mut state, message)?;
        state.acknowledged += 1;
        Ok(())
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<()> {
        let mut state = self.lock();
        let original = Self::take_unacked(&mut state, message)?;
        if requeue {
            state.ready.push_front(original.detached());
            drop(state);
            self.arrivals.notify_one();
        } else {
            state.dead_letters.push(original.detached());
        }
        Ok(())
    }

    async fn requeue(&self, message: &Message) -> Result<()> {
        let mut state = self.lock();
        let original = Self::take_unacked(&mut state, message)?;
        let mut copy = original.detached();
        copy.increment_handled_count();
        state.ready.push_back(copy);
        state.requeued += 1;
        drop(state);
        self.arrivals.notify_one();
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        let purged = {
            let mut state = self.lock();
            let purged = state.ready.len();
            state.ready.clear();
            purged
        };
        debug!(queue = %self.binding.queue, purged, "Purged queue");
        Ok(())
    }

    async fn close(&self) {
        self.lock().closed = true;
        self.arrivals.notify_waiters();
    }
}

/// In-process direct exchange: owns queues, routes by topic.
#[derive(Default)]
pub struct InMemoryChannelFactory {
    queues: Mutex<HashMap<String, Arc<InMemoryChannel>>>,
}

impl InMemoryChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue named `queue`, if a channel has been created for it.
    pub fn channel(&self, queue: &str) -> Option<Arc<InMemoryChannel>> {
        self.lock().get(queue).cloned()
    }

    /// Get or create the queue for `binding`.
    pub fn declare(&self, binding: &ChannelBinding) -> Arc<InMemoryChannel> {
        self.lock()
            .entry(binding.queue.clone())
            .or_insert_with(|| {
                info!(
                    queue = %binding.queue,
                    routing_key = %binding.routing_key,
                    "Declared in-memory queue"
                );
                Arc::new(InMemoryChannel::new(binding.clone()))
            })
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<InMemoryChannel>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChannelFactory for InMemoryChannelFactory {
    fn create_input_channel(&self, binding: &ChannelBinding) -> Result<Arc<dyn MessageChannel>> {
        Ok(self.declare(binding))
    }
}

#[async_trait]
impl MessageProducer for InMemoryChannelFactory {
    async fn send(&self, message: &Message) -> Result<()> {
        let targets: Vec<Arc<InMemoryChannel>> = self
            .lock()
            .values()
            .filter(|channel| channel.binding.routing_key == message.header.topic)
            .cloned()
            .collect();

        if targets.is_empty() {
            debug!(topic = %message.header.topic, "No queue bound for topic, message dropped");
        }

        // A closed queue must not starve the other queues bound to the topic.
        let mut first_error = None;
        for channel in targets {
            if let Err(e) = channel.send(message).await {
                warn!(
                    queue = %channel.binding.queue,
                    message_id = %message.id(),
                    error = %e,
                    "Failed to route message to queue"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageHeader, MessageType};
    use uuid::Uuid;

    fn binding() -> ChannelBinding {
        ChannelBinding::new("greeting.command", "greeting.command")
    }

    fn message() -> Message {
        Message::new(
            MessageHeader::new(Uuid::new_v4(), "greeting.command", MessageType::Command),
            "hello",
        )
    }

    async fn delivered(channel: &InMemoryChannel) -> Message {
        match channel.receive(Duration::from_millis(50)).await {
            ReceiveOutcome::Delivered(message) => message,
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_queue() {
        let channel = InMemoryChannel::new(binding());
        let outcome = channel.receive(Duration::from_millis(10)).await;
        assert!(matches!(outcome, ReceiveOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let channel = Arc::new(InMemoryChannel::new(binding()));
        let receiver = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.receive(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let sent = message();
        channel.send(&sent).await.unwrap();

        match receiver.await.unwrap() {
            ReceiveOutcome::Delivered(received) => assert_eq!(received, sent),
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_acknowledge_removes_from_unacked() {
        let channel = InMemoryChannel::new(binding());
        channel.send(&message()).await.unwrap();

        let received = delivered(&channel).await;
        assert_eq!(channel.unacked_count(), 1);
        assert!(received.delivery_tag().is_some());

        channel.acknowledge(&received).await.unwrap();
        assert!(channel.is_drained());
        assert_eq!(channel.acknowledged_count(), 1);

        // Second ack of the same tag is a protocol error.
        assert!(channel.acknowledge(&received).await.is_err());
    }

    #[tokio::test]
    async fn test_acknowledge_requires_delivery_tag() {
        let channel = InMemoryChannel::new(binding());
        let result = channel.acknowledge(&message()).await;
        assert!(matches!(result, Err(ChannelError::NotDelivered(_))));
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers_first() {
        let channel = InMemoryChannel::new(binding());
        let first = message();
        channel.send(&first).await.unwrap();
        channel.send(&message()).await.unwrap();

        let received = delivered(&channel).await;
        channel.reject(&received, true).await.unwrap();

        assert_eq!(delivered(&channel).await, first);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let channel = InMemoryChannel::new(binding());
        channel.send(&message()).await.unwrap();

        let received = delivered(&channel).await;
        channel.reject(&received, false).await.unwrap();

        assert!(channel.is_drained());
        assert_eq!(channel.dead_letters(), vec![received]);
    }

    #[tokio::test]
    async fn test_requeue_moves_to_back_and_increments_handled_count() {
        let channel = InMemoryChannel::new(binding());
        let first = message();
        let second = message();
        channel.send(&first).await.unwrap();
        channel.send(&second).await.unwrap();

        let received = delivered(&channel).await;
        channel.requeue(&received).await.unwrap();

        assert_eq!(delivered(&channel).await, second);
        let redelivered = delivered(&channel).await;
        assert_eq!(redelivered.id(), first.id());
        assert_eq!(redelivered.handled_count(), 1);
        assert_eq!(channel.requeued_count(), 1);
    }

    #[tokio::test]
    async fn test_purge_clears_ready_messages() {
        let channel = InMemoryChannel::new(binding());
        for _ in 0..3 {
            channel.send(&message()).await.unwrap();
        }

        channel.purge().await.unwrap();
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_reports_channel_lost() {
        let channel = InMemoryChannel::new(binding());
        channel.fail_next_receive(BrokerError::AlreadyClosed("connection reset".to_string()));

        let outcome = channel.receive(Duration::from_millis(10)).await;
        assert!(matches!(
            outcome,
            ReceiveOutcome::ChannelLost(ChannelError::Failure(BrokerError::AlreadyClosed(_)))
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_reports_channel_lost() {
        let channel = InMemoryChannel::new(binding());
        channel.close().await;

        let outcome = channel.receive(Duration::from_millis(10)).await;
        assert!(matches!(outcome, ReceiveOutcome::ChannelLost(ChannelError::Closed(_))));
        assert!(channel.send(&message()).await.is_err());
    }

    #[tokio::test]
    async fn test_factory_routes_by_topic() {
        let factory = InMemoryChannelFactory::new();
        factory.create_input_channel(&binding()).unwrap();
        factory
            .create_input_channel(&ChannelBinding::new("other", "other"))
            .unwrap();

        factory.send(&message()).await.unwrap();

        assert_eq!(factory.channel("greeting.command").unwrap().len(), 1);
        assert_eq!(factory.channel("other").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_factory_reuses_declared_queue() {
        let factory = InMemoryChannelFactory::new();
        let first = factory.declare(&binding());
        let second = factory.declare(&binding());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_factory_delivers_past_closed_queue() {
        let factory = InMemoryChannelFactory::new();
        let closed = factory.declare(&ChannelBinding::new("audit", "greeting.command"));
        let open = factory.declare(&ChannelBinding::new("greeting.command", "greeting.command"));
        closed.close().await;

        let result = factory.send(&message()).await;

        assert!(matches!(result, Err(ChannelError::Closed(queue)) if queue == "audit"));
        assert_eq!(open.len(), 1);
        assert_eq!(closed.len(), 0);
    }
}
