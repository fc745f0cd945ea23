// Event bus
//
// A single fan-out task owns the subscriber list. Publishes and subscriptions
// travel through one command queue, so every subscriber observes the same
// global publish order. Delivery awaits each open subscriber: a slow consumer
// backs up the fan-out task and, once the queue is full, the publishers.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ExecutionError, Result};
use crate::event::RunEvent;

/// Default size of the command queue and of each subscription buffer
pub const DEFAULT_CAPACITY: usize = 64;

enum Command {
    Publish(RunEvent),
    Subscribe(mpsc::Sender<RunEvent>),
    Flush(oneshot::Sender<()>),
}

/// Multi-subscriber publish/subscribe of run events
#[derive(Clone)]
pub struct EventBus {
    commands: mpsc::Sender<Command>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus and spawn its fan-out task on the current runtime
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (commands, rx) = mpsc::channel(capacity);
        tokio::spawn(fan_out(rx));
        Self { commands, capacity }
    }

    /// Publish an event to every current subscriber
    pub async fn publish(&self, event: RunEvent) -> Result<()> {
        self.commands
            .send(Command::Publish(event))
            .await
            .map_err(|_| ExecutionError::BusClosed)
    }

    /// Register a subscriber that receives every event published after this call
    pub async fn subscribe(&self) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.commands
            .send(Command::Subscribe(tx))
            .await
            .map_err(|_| ExecutionError::BusClosed)?;
        Ok(Subscription { rx })
    }

    /// Wait until every event published before this call reached the buffers
    /// of its subscribers
    ///
    /// A subscriber awaiting this must keep reading its subscription, since
    /// delivery to a full buffer holds up the fan-out task.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .await
            .map_err(|_| ExecutionError::BusClosed)?;
        rx.await.map_err(|_| ExecutionError::BusClosed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

async fn fan_out(mut commands: mpsc::Receiver<Command>) {
    let mut subscribers: Vec<mpsc::Sender<RunEvent>> = Vec::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Subscribe(tx) => subscribers.push(tx),
            Command::Publish(event) => {
                let mut open = Vec::with_capacity(subscribers.len());
                for subscriber in subscribers.drain(..) {
                    if subscriber.send(event.clone()).await.is_ok() {
                        open.push(subscriber);
                    } else {
                        tracing::debug!(run_id = event.run_id, "Dropping closed subscription");
                    }
                }
                subscribers = open;
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    tracing::debug!("Event bus fan-out stopped");
}

/// Stream of events for one subscriber
///
/// Dropping the subscription detaches it; the fan-out task forgets it on the
/// next publish.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<RunEvent>,
}

impl Subscription {
    /// Next event, or None once the bus is gone
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    /// Next already delivered event, without waiting
    pub fn try_recv(&mut self) -> Option<RunEvent> {
        self.rx.try_recv().ok()
    }

    /// Detach from the bus
    pub fn close(mut self) {
        self.rx.close();
    }
}

impl Stream for Subscription {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
