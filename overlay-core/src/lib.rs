//! Core of a friend-to-friend overlay network: mutually authenticated
//! direct links between friends, a probe/establish/reset routing layer
//! that carries virtual paths across the friend graph, and a
//! BitTorrent-style piece-exchange protocol that runs as a tenant on
//! top of those paths.

pub mod bt;
pub mod config;
pub mod connector;
pub mod controller;
pub mod friend;
pub mod identity;
pub mod link;
pub mod publisher;
pub mod scfq;
pub mod tls;
pub mod verifier;
