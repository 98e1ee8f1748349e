//! Astacus - cluster-wide backup and restore.
//!
//! One binary provides two roles. A *node* owns a local data directory,
//! maintains a hashed hard-link mirror of it and moves content addressed
//! blobs to and from an object store. A *coordinator* drives all nodes of
//! a cluster through one logical backup or restore at a time, holding a
//! TTL bounded lease on every node for the duration of the operation.
//!
//! Blobs are keyed by the blake2s hexdigest of their content, so identical
//! files on different nodes are uploaded exactly once per cluster.

pub mod tools;

pub mod common;

pub mod config;

pub mod node;

pub mod coordinator;

pub mod server;
