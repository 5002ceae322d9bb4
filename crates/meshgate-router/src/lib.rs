//! Routing table for advertised provider services
//!
//! Gateways merge `advRoutes` fragments into a table of entries keyed by
//! (gate port, service host, protocol, tags). Each entry holds one route per
//! advertising peer; routes expire unless re-advertised and are evicted
//! lazily when selection walks past them.

pub mod table;

pub use table::{Route, RouteError, RouteQuery, RouteSelection, RoutingEntry, RoutingTable, ROUTE_TTL};
