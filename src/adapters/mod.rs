//! Adapters implementing the domain ports against concrete backends.

pub mod sqlite;
