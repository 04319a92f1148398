use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::models::TaskEvent;

enum Topic {
    Open(Vec<mpsc::UnboundedSender<TaskEvent>>),
    Closed { at: Instant },
}

#[derive(Default)]
struct Topics {
    live: HashMap<String, Topic>,
    // Ids of closed topics past retention. Kept so they stay closed.
    finished: HashSet<String>,
}

#[derive(Default)]
pub struct NotificationBus {
    topics: Mutex<Topics>,
}

pub struct Subscription {
    task_id: String,
    rx: mpsc::UnboundedReceiver<TaskEvent>,
}

impl Subscription {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn next(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<TaskEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, task_id: &str, event: TaskEvent) -> bool {
        let mut topics = self.topics.lock().await;
        if topics.finished.contains(task_id) {
            debug!(task_id, "Discarding event for closed topic");
            return false;
        }
        let topic = topics
            .live
            .entry(task_id.to_string())
            .or_insert_with(|| Topic::Open(Vec::new()));

        let Topic::Open(subscribers) = topic else {
            debug!(task_id, "Discarding event for closed topic");
            return false;
        };

        let terminal = event.is_terminal();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if terminal {
            *topic = Topic::Closed { at: Instant::now() };
        }
        true
    }

    pub async fn subscribe(&self, task_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().await;
        // Dropping `tx` for a closed topic ends the stream immediately.
        if !topics.finished.contains(task_id) {
            let topic = topics
                .live
                .entry(task_id.to_string())
                .or_insert_with(|| Topic::Open(Vec::new()));
            if let Topic::Open(subscribers) = topic {
                subscribers.push(tx);
            }
        }
        Subscription {
            task_id: task_id.to_string(),
            rx,
        }
    }

    pub async fn close(&self, task_id: &str) {
        let mut topics = self.topics.lock().await;
        if topics.finished.contains(task_id) {
            return;
        }
        match topics.live.get_mut(task_id) {
            Some(Topic::Closed { .. }) => {}
            Some(topic) => *topic = Topic::Closed { at: Instant::now() },
            None => {
                topics
                    .live
                    .insert(task_id.to_string(), Topic::Closed { at: Instant::now() });
            }
        }
    }

    pub async fn prune(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut guard = self.topics.lock().await;
        let Topics { live, finished } = &mut *guard;
        let before = live.len();
        live.retain(|task_id, topic| match topic {
            Topic::Open(subscribers) => {
                subscribers.retain(|tx| !tx.is_closed());
                !subscribers.is_empty()
            }
            Topic::Closed { at } if now.duration_since(*at) >= retention => {
                finished.insert(task_id.clone());
                false
            }
            Topic::Closed { .. } => true,
        });
        before - live.len()
    }
}
