//! Restarting an allocator over its persisted state

use ipam::db::Db;
use ipam::gossip::{GossipError, GossipTransport};
use ipam::{Address, Allocator, AllocatorConfig, AllocatorError, Cidr, FileDb, PeerName, SystemClock};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A peer with nobody to talk to.
struct Isolated;

impl GossipTransport for Isolated {
    fn gossip_unicast(&self, dest: &PeerName, _msg: Vec<u8>) -> Result<(), GossipError> {
        Err(GossipError::UnknownPeer(dest.clone()))
    }

    fn gossip_broadcast(&self, _msg: Vec<u8>) {}

    fn is_known_peer(&self, _peer: &PeerName) -> bool {
        false
    }
}

fn start(dir: &Path, name: &str, universe: &str, seeded: bool) -> Allocator {
    let name = PeerName::from(name);
    let mut config = AllocatorConfig::new(name.clone(), universe.parse().expect("universe"));
    if seeded {
        config.seed = vec![name];
    }
    let mut alloc = Allocator::new(
        config,
        Arc::new(Isolated),
        Arc::new(FileDb::open(dir).expect("db")),
        Arc::new(SystemClock),
    );
    alloc.start().expect("start");
    alloc
}

fn allocate(alloc: &mut Allocator, ident: &str, subnet: &str) -> Address {
    let (tx, mut rx) = oneshot::channel();
    alloc.allocate(ident, subnet.parse().expect("subnet"), true, None, tx);
    rx.try_recv().expect("reply").expect("allocation")
}

#[test]
fn test_restart_restores_ring_and_ownership() {
    let dir = tempfile::tempdir().expect("tempdir");
    let addr = {
        let mut alloc = start(dir.path(), "a", "10.2.0.0/24", true);
        allocate(&mut alloc, "c1", "10.2.0.0/24")
    };

    // no seed this time: the ring must come from disk
    let mut alloc = start(dir.path(), "a", "10.2.0.0/24", false);
    assert!(!alloc.ring().is_empty());
    assert_eq!(alloc.space().num_owned(), 256);
    assert!(!alloc.space().is_free(addr));

    let universe: Cidr = "10.2.0.0/24".parse().expect("universe");
    assert_eq!(alloc.lookup("c1", &universe.range()), vec![universe.with_addr(addr)]);

    // the next allocation skips the restored address
    assert_ne!(allocate(&mut alloc, "c2", "10.2.0.0/24"), addr);
}

#[test]
fn test_restart_under_another_name_discards_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut alloc = start(dir.path(), "a", "10.2.0.0/24", true);
        allocate(&mut alloc, "c1", "10.2.0.0/24");
    }

    let alloc = start(dir.path(), "b", "10.2.0.0/24", false);
    assert!(alloc.ring().is_empty());
    assert!(alloc.lookup("c1", &"10.2.0.0/24".parse::<Cidr>().expect("cidr").range()).is_empty());

    // the discarded data was overwritten with ours
    let db = FileDb::open(dir.path()).expect("db");
    let name = db.load("peername").expect("load").expect("peername");
    assert_eq!(name, br#""b""#);
}

#[test]
fn test_restart_with_another_universe_discards_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut alloc = start(dir.path(), "a", "10.2.0.0/24", true);
        allocate(&mut alloc, "c1", "10.2.0.0/24");
    }

    let alloc = start(dir.path(), "a", "10.3.0.0/24", true);
    let universe: Cidr = "10.3.0.0/24".parse().expect("universe");
    assert_eq!(alloc.ring().range(), universe.range());
    assert_eq!(alloc.space().num_allocated(), 0);
}

#[test]
fn test_unreadable_state_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = FileDb::open(dir.path()).expect("db");
    db.save("ring", b"{ not a ring").expect("save");

    let mut alloc = Allocator::new(
        AllocatorConfig::new(PeerName::from("a"), "10.2.0.0/24".parse().expect("universe")),
        Arc::new(Isolated),
        Arc::new(db),
        Arc::new(SystemClock),
    );
    assert!(matches!(alloc.start(), Err(AllocatorError::Persistence(_))));
}
