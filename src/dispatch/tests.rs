use super::*;
use crate::broker::BrokerError;
use crate::channel::{InMemoryChannelFactory, MessageProducer};
use crate::config::ConnectionConfig;
use crate::mapper::MessageMapperRegistry;
use crate::message::{Message, MessageHeader, MessageType};
use crate::processor::HandlerError;
use crate::test_utils::{
    command_message, event_message, mapper_registry, wait_until, Dispatched,
    SpyCommandProcessor, MY_COMMAND, MY_COMMAND_TOPIC, MY_EVENT, MY_EVENT_TOPIC,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

fn commands() -> ConnectionConfig {
    ConnectionConfig::new("commands", MY_COMMAND_TOPIC, MY_COMMAND_TOPIC, MY_COMMAND)
        .with_timeout(Duration::from_millis(20))
}

fn events() -> ConnectionConfig {
    ConnectionConfig::new("events", MY_EVENT_TOPIC, MY_EVENT_TOPIC, MY_EVENT)
        .with_timeout(Duration::from_millis(20))
}

struct Fixture {
    dispatcher: Dispatcher,
    processor: Arc<SpyCommandProcessor>,
    factory: Arc<InMemoryChannelFactory>,
}

fn fixture(connections: Vec<ConnectionConfig>) -> Fixture {
    let processor = Arc::new(SpyCommandProcessor::new());
    let factory = Arc::new(InMemoryChannelFactory::new());
    let dispatcher = DispatchBuilder::new()
        .command_processor(processor.clone())
        .message_mappers(mapper_registry())
        .channel_factory(factory.clone())
        .connections(connections)
        .build()
        .unwrap();

    Fixture {
        dispatcher,
        processor,
        factory,
    }
}

fn builder(connections: Vec<ConnectionConfig>) -> DispatchBuilder {
    DispatchBuilder::new()
        .command_processor(Arc::new(SpyCommandProcessor::new()))
        .message_mappers(mapper_registry())
        .channel_factory(Arc::new(InMemoryChannelFactory::new()))
        .connections(connections)
}

// ============================================================================
// Builder validation
// ============================================================================

#[test]
fn test_build_rejects_duplicate_names() {
    let result = builder(vec![commands(), commands()]).build();
    assert!(matches!(result, Err(DispatchError::DuplicateConnection(name)) if name == "commands"));
}

#[test]
fn test_build_rejects_zero_performers() {
    let result = builder(vec![commands().with_performers(0)]).build();
    assert!(matches!(result, Err(DispatchError::NoPerformers(_))));
}

#[test]
fn test_build_rejects_unknown_request_type() {
    let result = DispatchBuilder::new()
        .command_processor(Arc::new(SpyCommandProcessor::new()))
        .message_mappers(MessageMapperRegistry::new())
        .channel_factory(Arc::new(InMemoryChannelFactory::new()))
        .connections(vec![commands()])
        .build();

    match result {
        Err(DispatchError::MissingMapper {
            connection,
            request_type,
        }) => {
            assert_eq!(connection, "commands");
            assert_eq!(request_type, MY_COMMAND);
        }
        other => panic!("expected missing mapper, got {other:?}"),
    }
}

#[test]
fn test_build_rejects_empty_connection_list() {
    let result = builder(Vec::new()).build();
    assert!(matches!(result, Err(DispatchError::NoConnections)));
}

#[test]
fn test_build_requires_components() {
    let result = DispatchBuilder::new().connections(vec![commands()]).build();
    assert!(matches!(result, Err(DispatchError::MissingComponent(_))));
}

#[test]
fn test_build_does_not_start_performers() {
    let f = fixture(vec![commands(), events()]);
    assert_eq!(f.dispatcher.connections(), vec!["commands", "events"]);
    assert!(f.factory.channel(MY_COMMAND_TOPIC).is_some());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_lifecycle_states() {
    let f = fixture(vec![commands()]);
    assert_eq!(f.dispatcher.state().await, DispatcherState::Awaiting);
    assert!(f.dispatcher.consumers().await.is_empty());

    f.dispatcher.receive().await.unwrap();
    assert_eq!(f.dispatcher.state().await, DispatcherState::Running);
    assert_eq!(f.dispatcher.consumers().await.len(), 1);

    // Receiving again is a no-op.
    f.dispatcher.receive().await.unwrap();
    assert_eq!(f.dispatcher.consumers().await.len(), 1);

    f.dispatcher.end().await.unwrap();
    assert_eq!(f.dispatcher.state().await, DispatcherState::Stopped);
    assert!(f.dispatcher.consumers().await.is_empty());

    // Ending again is a no-op.
    f.dispatcher.end().await.unwrap();
}

#[tokio::test]
async fn test_stopped_dispatcher_refuses_to_restart() {
    let f = fixture(vec![commands()]);
    f.dispatcher.receive().await.unwrap();
    f.dispatcher.end().await.unwrap();

    assert!(matches!(
        f.dispatcher.receive().await,
        Err(DispatchError::InvalidState {
            state: DispatcherState::Stopped,
            ..
        })
    ));
    assert!(matches!(
        f.dispatcher.open("commands").await,
        Err(DispatchError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_unknown_connection_name() {
    let f = fixture(vec![commands()]);
    assert!(matches!(
        f.dispatcher.shut("nope").await,
        Err(DispatchError::UnknownConnection(name)) if name == "nope"
    ));
    assert!(matches!(
        f.dispatcher.open("nope").await,
        Err(DispatchError::UnknownConnection(_))
    ));
}

#[tokio::test]
async fn test_open_before_receive_starts_only_that_connection() {
    let f = fixture(vec![commands(), events()]);

    f.dispatcher.open("events").await.unwrap();

    assert_eq!(f.dispatcher.state().await, DispatcherState::Running);
    assert_eq!(f.dispatcher.consumer_count("events").await, 1);
    assert_eq!(f.dispatcher.consumer_count("commands").await, 0);
    f.dispatcher.end().await.unwrap();
}

#[tokio::test]
async fn test_open_with_live_performers_is_a_no_op() {
    let f = fixture(vec![commands().with_performers(2)]);
    f.dispatcher.receive().await.unwrap();

    f.dispatcher.open("commands").await.unwrap();

    assert_eq!(f.dispatcher.consumers().await.len(), 2);
    f.dispatcher.end().await.unwrap();
}

#[tokio::test]
async fn test_end_closes_channels() {
    let f = fixture(vec![commands()]);
    f.dispatcher.receive().await.unwrap();
    f.dispatcher.end().await.unwrap();

    let channel = f.factory.channel(MY_COMMAND_TOPIC).unwrap();
    assert!(channel.send(&command_message("late")).await.is_err());
}

// ============================================================================
// Pump behaviour
// ============================================================================

#[tokio::test]
async fn test_command_is_sent_and_acknowledged() {
    let f = fixture(vec![commands()]);
    let channel = f.factory.channel(MY_COMMAND_TOPIC).unwrap();
    let message = command_message("hello");
    channel.send(&message).await.unwrap();

    f.dispatcher.receive().await.unwrap();
    assert!(wait_until(WAIT, || channel.acknowledged_count() == 1).await);
    f.dispatcher.end().await.unwrap();

    assert_eq!(f.processor.received(), vec![(Dispatched::Sent, message.id())]);
    assert!(channel.is_drained());
}

#[tokio::test]
async fn test_event_is_published() {
    let f = fixture(vec![events()]);
    let channel = f.factory.channel(MY_EVENT_TOPIC).unwrap();
    let message = event_message("happened");
    f.factory.send(&message).await.unwrap();

    f.dispatcher.receive().await.unwrap();
    assert!(wait_until(WAIT, || channel.acknowledged_count() == 1).await);
    f.dispatcher.end().await.unwrap();

    assert_eq!(
        f.processor.received(),
        vec![(Dispatched::Published, message.id())]
    );
}

#[tokio::test]
async fn test_unmappable_message_is_rejected_and_pump_continues() {
    let f = fixture(vec![commands()]);
    let channel = f.factory.channel(MY_COMMAND_TOPIC).unwrap();
    let garbage = Message::new(
        MessageHeader::new(Uuid::new_v4(), MY_COMMAND_TOPIC, MessageType::Command),
        "{not json",
    );
    channel.send(&garbage).await.unwrap();
    channel.send(&command_message("fine")).await.unwrap();

    f.dispatcher.receive().await.unwrap();
    assert!(wait_until(WAIT, || channel.acknowledged_count() == 1).await);

    assert_eq!(channel.dead_letters(), vec![garbage]);
    assert_eq!(f.processor.count(), 1);
    assert_eq!(f.dispatcher.consumer_count("commands").await, 1);
    f.dispatcher.end().await.unwrap();
}

#[tokio::test]
async fn test_unacceptable_and_empty_messages_are_rejected() {
    let f = fixture(vec![commands()]);
    let channel = f.factory.channel(MY_COMMAND_TOPIC).unwrap();
    let unacceptable = Message::new(
        MessageHeader::new(Uuid::new_v4(), MY_COMMAND_TOPIC, MessageType::Unacceptable),
        "??",
    );
    channel.send(&unacceptable).await.unwrap();
    channel.send(&Message::empty()).await.unwrap();

    f.dispatcher.receive().await.unwrap();
    assert!(wait_until(WAIT, || channel.dead_letters().len() == 2).await);
    f.dispatcher.end().await.unwrap();

    assert_eq!(f.processor.count(), 0);
    assert!(channel.is_drained());
}

#[tokio::test]
async fn test_transient_failure_requeues_until_limit() {
    let f = fixture(vec![commands().with_requeue_limit(2)]);
    f.processor
        .set_failure(HandlerError::Transient("database busy".to_string()));
    let channel = f.factory.channel(MY_COMMAND_TOPIC).unwrap();
    let message = command_message("retry me");
    channel.send(&message).await.unwrap();

    f.dispatcher.receive().await.unwrap();
    assert!(wait_until(WAIT, || channel.dead_letters().len() == 1).await);
    f.dispatcher.end().await.unwrap();

    assert_eq!(f.processor.count_of(message.id()), 3);
    assert_eq!(channel.requeued_count(), 2);
    assert_eq!(channel.dead_letters()[0].handled_count(), 2);
    assert!(channel.is_drained());
}

#[tokio::test]
async fn test_transient_failure_then_success_is_acknowledged() {
    let f = fixture(vec![commands()]);
    f.processor
        .fail_times(HandlerError::Transient("lock timeout".to_string()), 1);
    let channel = f.factory.channel(MY_COMMAND_TOPIC).unwrap();
    channel.send(&command_message("eventually")).await.unwrap();

    f.dispatcher.receive().await.unwrap();
    assert!(wait_until(WAIT, || channel.acknowledged_count() == 1).await);
    f.dispatcher.end().await.unwrap();

    assert_eq!(f.processor.count(), 2);
    assert_eq!(channel.requeued_count(), 1);
    assert!(channel.dead_letters().is_empty());
}

#[tokio::test]
async fn test_fatal_failure_rejects_without_requeue() {
    let f = fixture(vec![commands()]);
    f.processor
        .set_failure(HandlerError::Fatal("invalid order".to_string()));
    let channel = f.factory.channel(MY_COMMAND_TOPIC).unwrap();
    channel.send(&command_message("bad")).await.unwrap();

    f.dispatcher.receive().await.unwrap();
    assert!(wait_until(WAIT, || channel.dead_letters().len() == 1).await);
    f.dispatcher.end().await.unwrap();

    assert_eq!(f.processor.count(), 1);
    assert_eq!(channel.requeued_count(), 0);
}

#[tokio::test]
async fn test_channel_failure_shuts_only_that_performer() {
    let f = fixture(vec![commands(), events()]);
    f.dispatcher.receive().await.unwrap();

    let command_channel = f.factory.channel(MY_COMMAND_TOPIC).unwrap();
    command_channel.fail_next_receive(BrokerError::OperationInterrupted(
        "connection forced".to_string(),
    ));

    let mut shut = false;
    for _ in 0..200 {
        let consumers = f.dispatcher.consumers().await;
        if consumers
            .iter()
            .any(|c| c.name == "commands" && c.state == ConsumerState::Shut)
        {
            shut = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(shut, "failed performer should be reported shut");
    assert_eq!(f.dispatcher.state().await, DispatcherState::Running);
    assert_eq!(f.dispatcher.consumer_count("events").await, 1);

    // The sibling connection still processes messages.
    let event_channel = f.factory.channel(MY_EVENT_TOPIC).unwrap();
    event_channel.send(&event_message("still here")).await.unwrap();
    assert!(wait_until(WAIT, || event_channel.acknowledged_count() == 1).await);

    // Reopening replaces the failed performer.
    f.dispatcher.open("commands").await.unwrap();
    let consumers = f.dispatcher.consumers().await;
    let commands: Vec<_> = consumers.iter().filter(|c| c.name == "commands").collect();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].state, ConsumerState::Open);

    f.dispatcher.end().await.unwrap();
}
