//! git plumbing for the repository operations service: subprocess
//! execution, object and reference primitives, tree editing, the hook
//! protocol and hook-gated reference transactions.

pub mod catfile;
pub mod command;
pub mod command_factory;
pub mod commit;
pub mod hooks;
pub mod object_id;
pub mod reference;
pub mod remote;
pub mod repository;
pub mod transaction;
pub mod tree;

#[cfg(test)]
pub(crate) mod testing;
