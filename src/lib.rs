//! projectgc library
//!
//! Cascading garbage collector for a control plane that hosts many project
//! partitions. The binary wires these modules to real clusters; tests drive
//! the same collector against an in-memory cluster.

pub mod cli;
pub mod config;
pub mod gc;
pub mod kube;

pub use gc::{CollectorOptions, GarbageCollector, PartitionId, PartitionSpec};
