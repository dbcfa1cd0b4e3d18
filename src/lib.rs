//! Table capacity and assignment engine for restaurants.
//!
//! One [`engine::Engine`] per restaurant owns holds, assignments, bookings and
//! the outbox, backed by its own WAL. The [`coordinator`] turns a booking into
//! an assignment; [`maintenance`] keeps hold state and the outbox moving.

pub mod availability;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod graph;
pub mod http;
pub mod lifecycle;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod outbox;
pub mod policy;
pub mod registry;
pub mod wal;
pub mod window;
