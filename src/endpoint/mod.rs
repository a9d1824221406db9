//! Endpoint Client (design notes §4.1): the outbound half that talks to a
//! remote tunnel daemon over REST + SSE.

pub mod client;
pub mod types;

pub use client::EndpointHandle;
