//! # Freepath Transport
//!
//! Link adapters for the Freepath protocol.
//!
//! This crate provides:
//! - [`LanLinkAdapter`]: TCP connections between peers on a local network
//! - [`MemoryLinkAdapter`]: in-process links over a shared [`MemoryNetwork`]
//! - The byte-level frame path both adapters share ([`codec`])
//!
//! Adapters never encrypt; they move serialized frames and report
//! connection lifecycle through [`freepath_core::LinkEvents`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
mod connection;
pub mod lan;
pub mod memory;
mod slot;

pub use lan::LanLinkAdapter;
pub use memory::{MemoryLinkAdapter, MemoryNetwork};
