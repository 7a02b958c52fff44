//! Cascading garbage collection across partitions
//!
//! Each partition (the root control plane or a project) gets its own
//! [`GraphBuilder`] that watches object metadata and maintains the ownership
//! graph. The [`GarbageCollector`] shares two rate-limited work queues and an
//! absent-owner cache across all partitions and runs the workers that delete
//! garbage and orphan dependents.

pub mod cache;
pub mod client;
pub mod collector;
pub mod discovery;
pub mod dump;
pub mod error;
pub mod graph;
pub mod graph_builder;
pub mod mapper;
pub mod model;
pub mod monitor;
pub mod node;
mod operations;
pub mod patch;
pub mod queue;

pub use client::{
    DeleteOptions, DiscoveredResource, DiscoveryClient, EventRecorder, GroupResource,
    GroupVersion, GroupVersionResource, MetadataClient, PropagationPolicy, ResourceMapper,
    ResourceMapping, ServerResources, TracingEventRecorder, WatchEvent, WatchStream,
};
pub use collector::{CollectorOptions, GarbageCollector, PartitionSpec};
pub use dump::{debug_router, serve_debug};
pub use error::{ClientError, GcError, Result};
pub use graph_builder::GraphBuilder;
pub use mapper::DiscoveryResourceMapper;
pub use model::{ObjectMetadata, ObjectReference, PartitionId};
pub use queue::RateLimiterConfig;
