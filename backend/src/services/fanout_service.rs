use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::log_info;

const TOPIC_CAPACITY: usize = 256;

/// Events mirrored to observers of a project or a conversation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FanoutEvent {
    Typing { active: bool },
    Chunk { text: String },
    ConversationCreated { conversation_id: String, title: String },
    TitleUpdated { conversation_id: String, title: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Project(String),
    Conversation(String),
}

impl Topic {
    pub fn project(id: &str) -> Self {
        Self::Project(id.to_string())
    }

    pub fn conversation(id: &str) -> Self {
        Self::Conversation(id.to_string())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Project(id) => write!(f, "project-{id}"),
            Self::Conversation(id) => write!(f, "conversation-{id}"),
        }
    }
}

/// An event plus the connection that caused it, if any.
#[derive(Debug, Clone)]
struct Envelope {
    origin: Option<String>,
    event: FanoutEvent,
}

/// One connection's view of a topic. Events the connection itself originated
/// are skipped.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    connection_id: String,
    receiver: broadcast::Receiver<Envelope>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub async fn recv(&mut self) -> Result<FanoutEvent, RecvError> {
        loop {
            let envelope = self.receiver.recv().await?;
            if !self.is_own(&envelope) {
                return Ok(envelope.event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<FanoutEvent, TryRecvError> {
        loop {
            let envelope = self.receiver.try_recv()?;
            if !self.is_own(&envelope) {
                return Ok(envelope.event);
            }
        }
    }

    fn is_own(&self, envelope: &Envelope) -> bool {
        envelope.origin.as_deref() == Some(self.connection_id.as_str())
    }
}

/// Publish/subscribe topics keyed by project or conversation.
///
/// Publishing never waits: a topic without subscribers drops the event and a
/// lagging subscriber misses the oldest ones.
#[derive(Clone, Default)]
pub struct FanoutHub {
    topics: Arc<DashMap<Topic, broadcast::Sender<Envelope>>>,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic, connection_id: &str) -> Subscription {
        let receiver = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();

        Subscription {
            topic,
            connection_id: connection_id.to_string(),
            receiver,
        }
    }

    /// Deliver to every subscriber except the `origin` connection. Returns how
    /// many receivers the event was handed to, the origin included.
    pub fn publish(&self, topic: &Topic, origin: Option<&str>, event: FanoutEvent) -> usize {
        let Some(sender) = self.topics.get(topic).map(|entry| entry.clone()) else {
            return 0;
        };

        let envelope = Envelope {
            origin: origin.map(str::to_string),
            event,
        };
        match sender.send(envelope) {
            Ok(count) => count,
            Err(_) => {
                self.prune(topic);
                0
            }
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop the subscription and close its topic if it was the last one.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let topic = subscription.topic.clone();
        drop(subscription);
        self.prune(&topic);
    }

    /// Drop a topic nobody listens to any more.
    pub fn prune(&self, topic: &Topic) {
        let removed = self
            .topics
            .remove_if(topic, |_, sender| sender.receiver_count() == 0);
        if removed.is_some() {
            log_info!("lmchat.fanout", "Closed idle topic {}", topic);
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
