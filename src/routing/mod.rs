//! Reactive route discovery and maintenance.

pub mod engine;
pub mod table;

pub use engine::{DiscoveryOutcome, RouteReplyAction, RouteRequestAction, RoutingEngine};
pub use table::{RouteEntry, RoutingTable};
