//! Reusable node fixtures.

mod two_node;

pub use two_node::{TestNode, TwoNodeFixture, contacts_of, wait_until};
