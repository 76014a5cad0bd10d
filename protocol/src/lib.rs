// Copyright (c) 2026 VEIL Contributors. MIT License.
// See LICENSE for details.

//! # VEIL Protocol — Core Library
//!
//! VEIL is a peer-to-peer overlay network for people who assume the network
//! is hostile: authenticated, eventually-consistent replicated storage and
//! confidential store-and-forward messaging among untrusted peers, over
//! clearnet, Tor, and I2P.
//!
//! Nothing here trusts anything. Every connection pays proof-of-work before
//! it is spoken to, every storage request is signed and sequence-checked,
//! and every private message is sealed so that relays and mailbox hosts see
//! ciphertext and a key hash, nothing more.
//!
//! ## Architecture
//!
//! The modules mirror the actual layers of the overlay:
//!
//! - **crypto** — Keys, hashes, sealed boxes. Don't roll your own.
//! - **transport** — Clearnet TCP, plus Tor/I2P via local SOCKS proxies.
//! - **envelope** — The versioned wire envelope and the closed payload enum.
//! - **authorization** — Hashcash tokens priced by message cost and peer load.
//! - **node** — Handshake, connections, and the per-identity [`node::Node`].
//! - **peer_group** — Seeds, ban list, keep-alive maintenance.
//! - **storage** — The replicated `hash → request` stores with
//!   sequence-number conflict resolution and tombstones.
//! - **data_service** — Publication, ingestion, and flood-based replication.
//! - **inventory** — Pull-based reconciliation for peers that were away.
//! - **confidential** — Sealed messaging with mailbox fallback and acks.
//! - **identity** — Persistent network identities across transports.
//! - **service_node** / **service_nodes** — Per-transport service bundles
//!   and the multi-transport facade applications actually talk to.
//!
//! ## Design Philosophy
//!
//! 1. Validation failures are data, not exceptions; a malicious request
//!    must never abort the batch it arrived in.
//! 2. Lifecycle mistakes are bugs and assert loudly.
//! 3. No unsafe code in crypto paths. We sleep at night.

pub mod authorization;
pub mod confidential;
pub mod config;
pub mod crypto;
pub mod data_service;
pub mod envelope;
pub mod identity;
pub mod inventory;
pub mod node;
pub mod peer_group;
pub mod service_node;
pub mod service_nodes;
pub mod storage;
pub mod transport;
