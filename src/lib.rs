//! Message-routing backbone for a small chat deployment.
//!
//! A round-robin [`dispatcher`](chat::dispatcher) fronts several
//! [`chat instances`](chat::server). Instances stamp every message with a
//! [Lamport clock](chat::clock), route private messages to locally
//! connected users, and ship a copy of each message to a
//! [replication sink](chat::replication). A [Bully election](chat::election)
//! picks a leader among instances.
pub mod chat;
pub mod config;
