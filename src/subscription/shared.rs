//! Shared-subscription groups.
//!
//! A group spreads one destination's messages over several member
//! subscriptions. Offers go round-robin; a member accepts only if it has
//! credit right now. Messages nobody accepts wait in the group backlog until
//! a member announces released credit on the [`CreditBus`].
//!
//! The coordinator is a single task, so all of a group's bookkeeping is
//! serialized the same way a subscription's is.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::task::{SubscriptionTask, TaskOutcome};
use super::SubscriptionHandle;
use crate::executor::ExecutorError;
use crate::flow::{CreditBus, CreditReleased};
use crate::message::Message;
use crate::pipeline::DeliveryTransport;

/// Point-in-time view of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub name: String,
    pub members: usize,
    /// Messages waiting for a member with credit
    pub backlog: usize,
    /// Messages accepted by some member
    pub dispatched: u64,
    /// Offers a member refused
    pub refused: u64,
}

enum GroupCommand<T> {
    Publish(Message),
    Join(SubscriptionHandle<T>),
    Leave(String),
    Stats(oneshot::Sender<GroupStats>),
}

/// Handle to a running group coordinator.
pub struct SharedGroup<T> {
    name: String,
    tx: mpsc::UnboundedSender<GroupCommand<T>>,
}

impl<T> Clone for SharedGroup<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: DeliveryTransport> SharedGroup<T> {
    /// Start a coordinator listening on `bus`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(name: impl Into<String>, bus: &CreditBus) -> (Self, JoinHandle<()>) {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            stats: GroupStats {
                name: name.clone(),
                ..GroupStats::default()
            },
            members: Vec::new(),
            cursor: 0,
            backlog: VecDeque::new(),
        };
        let join = tokio::spawn(coordinator.run(rx, bus.subscribe()));
        (Self { name, tx }, join)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish(&self, message: Message) -> Result<(), ExecutorError> {
        self.send(GroupCommand::Publish(message))
    }

    pub fn join(&self, member: SubscriptionHandle<T>) -> Result<(), ExecutorError> {
        self.send(GroupCommand::Join(member))
    }

    pub fn leave(&self, session_id: impl Into<String>) -> Result<(), ExecutorError> {
        self.send(GroupCommand::Leave(session_id.into()))
    }

    pub async fn stats(&self) -> Result<GroupStats, ExecutorError> {
        let (reply, rx) = oneshot::channel();
        self.send(GroupCommand::Stats(reply))?;
        rx.await.map_err(|_| ExecutorError::TaskDropped)
    }

    fn send(&self, command: GroupCommand<T>) -> Result<(), ExecutorError> {
        self.tx
            .send(command)
            .map_err(|_| ExecutorError::Closed(self.name.clone()))
    }
}

struct Coordinator<T> {
    stats: GroupStats,
    members: Vec<SubscriptionHandle<T>>,
    cursor: usize,
    backlog: VecDeque<Message>,
}

impl<T: DeliveryTransport> Coordinator<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<GroupCommand<T>>,
        mut credit: broadcast::Receiver<CreditReleased>,
    ) {
        let mut listening = true;
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle(command).await;
                }
                note = credit.recv(), if listening => match note {
                    Ok(note) if note.group == self.stats.name => {
                        tracing::trace!(
                            group = %self.stats.name,
                            session_id = %note.session_id,
                            released = note.released,
                            "Member released credit"
                        );
                        self.dispatch().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(group = %self.stats.name, skipped, "Credit notifications lagged");
                        self.dispatch().await;
                    }
                    Err(RecvError::Closed) => listening = false,
                },
            }
        }
        tracing::debug!(
            group = %self.stats.name,
            backlog = self.backlog.len(),
            "Shared group stopped"
        );
    }

    async fn handle(&mut self, command: GroupCommand<T>) {
        match command {
            GroupCommand::Publish(message) => {
                self.backlog.push_back(message);
                self.dispatch().await;
            }
            GroupCommand::Join(member) => {
                tracing::debug!(group = %self.stats.name, subscription = %member.key(), "Member joined");
                self.members.push(member);
                self.dispatch().await;
            }
            GroupCommand::Leave(session_id) => {
                self.members
                    .retain(|member| member.key().session_id != session_id);
                self.cursor = 0;
                tracing::debug!(group = %self.stats.name, session_id, "Member left");
            }
            GroupCommand::Stats(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> GroupStats {
        GroupStats {
            members: self.members.len(),
            backlog: self.backlog.len(),
            ..self.stats.clone()
        }
    }

    /// Offer backlog round-robin until it is empty or every member refuses.
    async fn dispatch(&mut self) {
        while let Some(message) = self.backlog.pop_front() {
            match self.offer(message).await {
                Ok(()) => self.stats.dispatched += 1,
                Err(message) => {
                    self.backlog.push_front(message);
                    break;
                }
            }
        }
    }

    async fn offer(&mut self, mut message: Message) -> Result<(), Message> {
        let count = self.members.len();
        for attempt in 0..count {
            let index = (self.cursor + attempt) % count;
            let Ok(handle) = self.members[index].submit(SubscriptionTask::Offer(message.clone()))
            else {
                continue;
            };
            match handle.await {
                Ok(TaskOutcome::Offered(Ok(()))) => {
                    self.cursor = (index + 1) % count;
                    return Ok(());
                }
                Ok(TaskOutcome::Offered(Err(refused))) => {
                    self.stats.refused += 1;
                    message = refused;
                }
                _ => {}
            }
        }
        Err(message)
    }
}
