//! # mpipe
//!
//! Distributed message pipes: producers append to named FIFO queues in a
//! shared durable store, and broker nodes dispatch them in batches to
//! registered consumers with at most one consumer per pipe at a time.
//!
//! This crate is a facade over [`mpipe_broker`]. The HTTP surface lives in
//! the `mpipe-server` binary.
//!
//! ## Features
//!
//! - `redis`: Redis-backed [`DurableStore`] shared across broker processes
//! - `http`: JSON-over-HTTP [`ConsumerTransport`]

pub use mpipe_broker as broker;
pub use mpipe_broker::*;
