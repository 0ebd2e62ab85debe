//! Integration tests: listener and publisher over the in-memory broker.

mod support;
mod commands;
mod events;
mod queries;
mod lifecycle;
