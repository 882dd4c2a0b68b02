use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Capacity of each agent's outbound queue. The hub never waits on a full
/// queue; an agent that falls this far behind is deregistered instead.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// One chat message as it crosses the wire, identical in both directions.
/// `sender_id`, `room_id` and `created_at` are server-assigned; anything a
/// client supplies for them is overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub sender_id: i64,
    pub room_id: Uuid,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentId(u64);

impl AgentId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Whether a forwarded message is also delivered back to the agent that
/// submitted it. `Suppress` skips the originating agent only; other
/// connections of the same user still receive the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoPolicy {
    #[default]
    Echo,
    Suppress,
}

/// The hub's view of one live connection: who it is, which room it watches,
/// and the queue its send loop drains. Dropping the handle closes the queue.
pub struct AgentHandle {
    pub id: AgentId,
    pub user_id: i64,
    pub room_id: Uuid,
    pub queue: mpsc::Sender<Arc<WireMessage>>,
}

enum Command {
    Register(AgentHandle),
    Deregister(AgentId),
    Forward { from: AgentId, message: Arc<WireMessage> },
}

/// Handle to the broadcast hub. All registry state lives inside a single
/// spawned task; the handle just submits commands, so register, deregister
/// and forward are processed strictly in submission order and never block.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<Command>,
}

impl Hub {
    pub fn spawn(echo: EchoPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, echo));
        Self { tx }
    }

    pub fn register(&self, agent: AgentHandle) {
        let _ = self.tx.send(Command::Register(agent));
    }

    /// Safe to call more than once per agent; extra calls are no-ops.
    pub fn deregister(&self, id: AgentId) {
        let _ = self.tx.send(Command::Deregister(id));
    }

    /// Submit an already persisted message for fan-out to its room.
    pub fn forward(&self, from: AgentId, message: WireMessage) {
        let _ = self.tx.send(Command::Forward {
            from,
            message: Arc::new(message),
        });
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, echo: EchoPolicy) {
    let mut registry = Registry::new(echo);
    while let Some(command) = rx.recv().await {
        match command {
            Command::Register(agent) => registry.register(agent),
            Command::Deregister(id) => registry.deregister(id),
            Command::Forward { from, message } => registry.forward(from, &message),
        }
    }
}

struct Registry {
    echo: EchoPolicy,
    agents: HashMap<AgentId, AgentHandle>,
    rooms: HashMap<Uuid, Vec<AgentId>>,
}

impl Registry {
    fn new(echo: EchoPolicy) -> Self {
        Self {
            echo,
            agents: HashMap::new(),
            rooms: HashMap::new(),
        }
    }

    fn register(&mut self, agent: AgentHandle) {
        if self.agents.contains_key(&agent.id) {
            tracing::warn!(agent = agent.id.as_u64(), "agent registered twice, ignoring");
            return;
        }
        self.rooms.entry(agent.room_id).or_default().push(agent.id);
        tracing::debug!(
            agent = agent.id.as_u64(),
            user = agent.user_id,
            room = %agent.room_id,
            "registered"
        );
        self.agents.insert(agent.id, agent);
    }

    fn deregister(&mut self, id: AgentId) {
        let Some(agent) = self.agents.remove(&id) else {
            return;
        };
        if let Some(ids) = self.rooms.get_mut(&agent.room_id) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.rooms.remove(&agent.room_id);
            }
        }
        tracing::debug!(agent = id.as_u64(), room = %agent.room_id, "deregistered");
        // dropping `agent` here drops the queue sender, which closes the
        // agent's outbound queue and lets its send loop finish
    }

    fn forward(&mut self, from: AgentId, message: &Arc<WireMessage>) {
        let Some(ids) = self.rooms.get(&message.room_id) else {
            return;
        };

        let mut kicked = Vec::new();
        for &id in ids {
            if self.echo == EchoPolicy::Suppress && id == from {
                continue;
            }
            let Some(agent) = self.agents.get(&id) else {
                continue;
            };
            match agent.queue.try_send(Arc::clone(message)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(agent = id.as_u64(), "outbound queue full, kicking agent");
                    kicked.push(id);
                }
                Err(TrySendError::Closed(_)) => kicked.push(id),
            }
        }

        for id in kicked {
            self.deregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(room_id: Uuid, sender_id: i64, content: &str) -> WireMessage {
        WireMessage {
            sender_id,
            room_id,
            content: content.to_owned(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn agent(
        room_id: Uuid,
        user_id: i64,
        capacity: usize,
    ) -> (AgentHandle, mpsc::Receiver<Arc<WireMessage>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = AgentHandle {
            id: AgentId::next(),
            user_id,
            room_id,
            queue: tx,
        };
        (handle, rx)
    }

    #[tokio::test]
    async fn fans_out_to_room_peers_including_sender() {
        let hub = Hub::spawn(EchoPolicy::Echo);
        let room = Uuid::now_v7();
        let (a, mut a_rx) = agent(room, 1, 8);
        let (b, mut b_rx) = agent(room, 2, 8);
        let a_id = a.id;
        hub.register(a);
        hub.register(b);

        hub.forward(a_id, wire(room, 1, "hello"));

        assert_eq!(b_rx.recv().await.unwrap().content, "hello");
        assert_eq!(a_rx.recv().await.unwrap().content, "hello");
    }

    #[tokio::test]
    async fn suppress_policy_skips_the_originating_agent() {
        let hub = Hub::spawn(EchoPolicy::Suppress);
        let room = Uuid::now_v7();
        let (a, mut a_rx) = agent(room, 1, 8);
        let (b, mut b_rx) = agent(room, 2, 8);
        let a_id = a.id;
        hub.register(a);
        hub.register(b);

        hub.forward(a_id, wire(room, 1, "hello"));

        assert_eq!(b_rx.recv().await.unwrap().content, "hello");
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let hub = Hub::spawn(EchoPolicy::Echo);
        let room_ab = Uuid::now_v7();
        let room_cd = Uuid::now_v7();
        let (a, _a_rx) = agent(room_ab, 1, 8);
        let (b, mut b_rx) = agent(room_ab, 2, 8);
        let (c, mut c_rx) = agent(room_cd, 3, 8);
        let a_id = a.id;
        hub.register(a);
        hub.register(b);
        hub.register(c);

        hub.forward(a_id, wire(room_ab, 1, "for b only"));

        assert_eq!(b_rx.recv().await.unwrap().content, "for b only");
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deregister_closes_the_outbound_queue() {
        let hub = Hub::spawn(EchoPolicy::Echo);
        let room = Uuid::now_v7();
        let (a, mut a_rx) = agent(room, 1, 8);
        let (b, mut b_rx) = agent(room, 2, 8);
        let a_id = a.id;
        let b_id = b.id;
        hub.register(a);
        hub.register(b);

        hub.deregister(b_id);
        hub.forward(a_id, wire(room, 1, "after the fact"));

        assert!(b_rx.recv().await.is_none());
        assert_eq!(a_rx.recv().await.unwrap().content, "after the fact");

        // a second deregister of the same agent is a no-op
        hub.deregister(b_id);
    }

    #[tokio::test]
    async fn forwarded_messages_drain_before_the_queue_closes() {
        let hub = Hub::spawn(EchoPolicy::Echo);
        let room = Uuid::now_v7();
        let (a, mut a_rx) = agent(room, 1, 8);
        let a_id = a.id;
        hub.register(a);

        hub.forward(a_id, wire(room, 1, "parting words"));
        hub.deregister(a_id);

        assert_eq!(a_rx.recv().await.unwrap().content, "parting words");
        assert!(a_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_agent_is_kicked_instead_of_stalling_the_hub() {
        let hub = Hub::spawn(EchoPolicy::Echo);
        let room = Uuid::now_v7();
        let (slow, mut slow_rx) = agent(room, 1, 1);
        let (healthy, mut healthy_rx) = agent(room, 2, 8);
        let healthy_id = healthy.id;
        hub.register(slow);
        hub.register(healthy);

        // the slow agent's queue holds one message; the second overflows it
        hub.forward(healthy_id, wire(room, 2, "one"));
        hub.forward(healthy_id, wire(room, 2, "two"));

        assert_eq!(healthy_rx.recv().await.unwrap().content, "one");
        assert_eq!(healthy_rx.recv().await.unwrap().content, "two");

        assert_eq!(slow_rx.recv().await.unwrap().content, "one");
        assert!(slow_rx.recv().await.is_none());
    }
}
