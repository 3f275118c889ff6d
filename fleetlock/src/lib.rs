//! `fleetlock` coordinates a fleet of IoT devices that share one resource over a publish/subscribe
//! broker. The fleet elects a coordinator with a bully election guarded by a lease and a quorum
//! check. The coordinator arbitrates a FIFO mutual-exclusion lock whose every decision is written
//! ahead to a log, so a successor can pick up the queue where its predecessor stopped. Devices keep
//! Lamport and vector clocks on every message and estimate their offset against a time server.
//!
//! Each device is a [`CoordNode`](node::CoordNode), a state machine that turns events into
//! effects without doing any I/O. [`runtime`] drives nodes on tokio over any
//! [`MessageBus`](bus::MessageBus). [`testkit::Simulation`] drives them on virtual time for
//! deterministic tests.

pub mod bus;
pub mod chaos;
pub mod clock;
pub mod config;
pub mod core;
pub mod election;
pub mod lock;
pub mod logging;
pub mod node;
pub mod runtime;
pub mod testkit;
pub mod time_server;
