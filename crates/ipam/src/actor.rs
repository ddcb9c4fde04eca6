//! Runs an [`Allocator`] on its own task and exposes it through a cloneable
//! handle.
//!
//! Requests travel over an mpsc channel; replies come back on oneshot
//! channels. Dropping a pending request's future drops its reply receiver,
//! which the allocator treats as cancellation on its next retry.

use crate::address::{Address, Cidr, Count, Range};
use crate::allocator::{Allocator, AllocatorStatus, TICK_INTERVAL};
use crate::error::AllocatorError;
use crate::peer::PeerName;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const COMMAND_BUFFER: usize = 256;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Allocate {
        ident: String,
        subnet: Cidr,
        is_container: bool,
        reply: Reply<Result<Address, AllocatorError>>,
    },
    Claim {
        ident: String,
        cidr: Cidr,
        is_container: bool,
        no_error_on_unknown: bool,
        reply: Reply<Result<(), AllocatorError>>,
    },
    Prime(Reply<Result<(), AllocatorError>>),
    Lookup {
        ident: String,
        range: Range,
        reply: Reply<Vec<Cidr>>,
    },
    Delete {
        ident: String,
        reply: Reply<Result<(), AllocatorError>>,
    },
    Free {
        ident: String,
        addr: Address,
        reply: Reply<Result<(), AllocatorError>>,
    },
    ContainerDied(String),
    ContainerDestroyed(String),
    ContainerStarted(String),
    PruneOwned {
        ids: Vec<String>,
        reply: Reply<Vec<String>>,
    },
    Shutdown(Reply<()>),
    AdminTakeover {
        peer: String,
        reply: Reply<Count>,
    },
    PeerGone(PeerName),
    GossipBroadcast {
        sender: PeerName,
        payload: Vec<u8>,
        reply: Reply<Result<(), AllocatorError>>,
    },
    GossipUnicast {
        sender: PeerName,
        payload: Vec<u8>,
        reply: Reply<Result<(), AllocatorError>>,
    },
    Encode(Reply<Result<Vec<u8>, AllocatorError>>),
    Status(Reply<AllocatorStatus>),
}

/// Cloneable handle on a running allocator.
#[derive(Debug, Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<Command>,
}

impl AllocatorHandle {
    /// Starts the actor loop. It stops once every handle is dropped.
    #[must_use]
    pub fn spawn(mut allocator: Allocator) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(async move {
            let peer = allocator.our_name().clone();
            info!(peer = %peer, "Allocator actor started");
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => handle(&mut allocator, cmd),
                        None => break,
                    },
                    _ = ticker.tick() => allocator.tick(),
                }
            }
            info!(peer = %peer, "Allocator actor stopped");
        });
        (Self { tx }, task)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, AllocatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| AllocatorError::ShuttingDown)?;
        rx.await.map_err(|_| AllocatorError::ShuttingDown)
    }

    async fn notify(&self, cmd: Command) {
        if self.tx.send(cmd).await.is_err() {
            debug!("Allocator actor gone; dropping notification");
        }
    }

    /// # Errors
    ///
    /// See [`Allocator::allocate`]; `ShuttingDown` once the actor has stopped.
    pub async fn allocate(&self, ident: &str, subnet: Cidr, is_container: bool) -> Result<Address, AllocatorError> {
        self.request(|reply| Command::Allocate {
            ident: ident.to_string(),
            subnet,
            is_container,
            reply,
        })
        .await?
    }

    /// # Errors
    ///
    /// See [`Allocator::claim`].
    pub async fn claim(
        &self,
        ident: &str,
        cidr: Cidr,
        is_container: bool,
        no_error_on_unknown: bool,
    ) -> Result<(), AllocatorError> {
        self.request(|reply| Command::Claim {
            ident: ident.to_string(),
            cidr,
            is_container,
            no_error_on_unknown,
            reply,
        })
        .await?
    }

    /// Waits until a ring exists.
    ///
    /// # Errors
    ///
    /// `ShuttingDown`.
    pub async fn prime(&self) -> Result<(), AllocatorError> {
        self.request(Command::Prime).await?
    }

    /// # Errors
    ///
    /// `ShuttingDown`.
    pub async fn lookup(&self, ident: &str, range: Range) -> Result<Vec<Cidr>, AllocatorError> {
        self.request(|reply| Command::Lookup {
            ident: ident.to_string(),
            range,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// `NotFound` when `ident` holds nothing.
    pub async fn delete(&self, ident: &str) -> Result<(), AllocatorError> {
        self.request(|reply| Command::Delete {
            ident: ident.to_string(),
            reply,
        })
        .await?
    }

    /// # Errors
    ///
    /// `NotFound` when `ident` does not hold `addr`.
    pub async fn free(&self, ident: &str, addr: Address) -> Result<(), AllocatorError> {
        self.request(|reply| Command::Free {
            ident: ident.to_string(),
            addr,
            reply,
        })
        .await?
    }

    pub async fn container_died(&self, ident: &str) {
        self.notify(Command::ContainerDied(ident.to_string())).await;
    }

    pub async fn container_destroyed(&self, ident: &str) {
        self.notify(Command::ContainerDestroyed(ident.to_string())).await;
    }

    pub async fn container_started(&self, ident: &str) {
        self.notify(Command::ContainerStarted(ident.to_string())).await;
    }

    /// # Errors
    ///
    /// `ShuttingDown`.
    pub async fn prune_owned(&self, ids: Vec<String>) -> Result<Vec<String>, AllocatorError> {
        self.request(|reply| Command::PruneOwned { ids, reply }).await
    }

    /// # Errors
    ///
    /// `ShuttingDown` if the actor already stopped.
    pub async fn shutdown(&self) -> Result<(), AllocatorError> {
        self.request(Command::Shutdown).await
    }

    /// # Errors
    ///
    /// `ShuttingDown`.
    pub async fn admin_takeover(&self, peer: &str) -> Result<Count, AllocatorError> {
        self.request(|reply| Command::AdminTakeover {
            peer: peer.to_string(),
            reply,
        })
        .await
    }

    pub async fn peer_gone(&self, peer: PeerName) {
        self.notify(Command::PeerGone(peer)).await;
    }

    /// # Errors
    ///
    /// See [`Allocator::on_gossip_broadcast`].
    pub async fn on_gossip_broadcast(&self, sender: PeerName, payload: Vec<u8>) -> Result<(), AllocatorError> {
        self.request(|reply| Command::GossipBroadcast { sender, payload, reply })
            .await?
    }

    /// # Errors
    ///
    /// See [`Allocator::on_gossip_unicast`].
    pub async fn on_gossip_unicast(&self, sender: PeerName, payload: Vec<u8>) -> Result<(), AllocatorError> {
        self.request(|reply| Command::GossipUnicast { sender, payload, reply })
            .await?
    }

    /// # Errors
    ///
    /// Serialization failures or `ShuttingDown`.
    pub async fn encode(&self) -> Result<Vec<u8>, AllocatorError> {
        self.request(Command::Encode).await?
    }

    /// # Errors
    ///
    /// `ShuttingDown`.
    pub async fn status(&self) -> Result<AllocatorStatus, AllocatorError> {
        self.request(Command::Status).await
    }
}

fn handle(alloc: &mut Allocator, cmd: Command) {
    match cmd {
        Command::Allocate {
            ident,
            subnet,
            is_container,
            reply,
        } => alloc.allocate(&ident, subnet, is_container, None, reply),
        Command::Claim {
            ident,
            cidr,
            is_container,
            no_error_on_unknown,
            reply,
        } => alloc.claim(&ident, cidr, is_container, no_error_on_unknown, None, reply),
        Command::Prime(reply) => alloc.prime(reply),
        Command::Lookup { ident, range, reply } => {
            let _ = reply.send(alloc.lookup(&ident, &range));
        }
        Command::Delete { ident, reply } => {
            let _ = reply.send(alloc.delete(&ident));
        }
        Command::Free { ident, addr, reply } => {
            let _ = reply.send(alloc.free(&ident, addr));
        }
        Command::ContainerDied(ident) => alloc.container_died(&ident),
        Command::ContainerDestroyed(ident) => alloc.container_destroyed(&ident),
        Command::ContainerStarted(ident) => alloc.container_started(&ident),
        Command::PruneOwned { ids, reply } => {
            let _ = reply.send(alloc.prune_owned(&ids));
        }
        Command::Shutdown(reply) => {
            alloc.shutdown();
            let _ = reply.send(());
        }
        Command::AdminTakeover { peer, reply } => {
            let _ = reply.send(alloc.admin_takeover(&peer));
        }
        Command::PeerGone(peer) => alloc.peer_gone(&peer),
        Command::GossipBroadcast { sender, payload, reply } => {
            let _ = reply.send(alloc.on_gossip_broadcast(&sender, &payload));
        }
        Command::GossipUnicast { sender, payload, reply } => {
            let _ = reply.send(alloc.on_gossip_unicast(&sender, &payload));
        }
        Command::Encode(reply) => {
            let _ = reply.send(alloc.encode());
        }
        Command::Status(reply) => {
            let _ = reply.send(alloc.status());
        }
    }
}
