//! A soft real-time, concurrent, conservative tri-color mark-sweep garbage
//! collector over a segregated-size heap.
//!
//! The collector runs on a dedicated collector thread (driven by
//! [`heap::RealtimeHeap::spawn_collector`] or pumped synchronously via
//! [`heap::RealtimeHeap::collect_cycle`]) concurrently with one or more
//! mutator threads. Reachability is preserved across a cycle by a
//! snapshot-at-the-beginning write barrier rather than a long stop-the-world
//! pause: mutators only suspend for the brief flip + root-scan safepoint
//! (see [`mutator`]).
//!
//! # Quick start
//!
//! ```
//! use realtime_gc::{HeapConfig, RealtimeHeap, StorageClass};
//!
//! let heap = RealtimeHeap::new(HeapConfig::default()).unwrap();
//! heap.register_mutator_thread();
//!
//! let ptr = heap.allocate(64, StorageClass::NoPointers).unwrap();
//! assert!(!ptr.as_ptr().is_null());
//!
//! // Nothing roots `ptr`, so one full cycle recycles it.
//! let stats = heap.collect_cycle().unwrap();
//! assert_eq!(stats.objects_recycled, 1);
//!
//! heap.unregister_mutator_thread();
//! ```
//!
//! # Module map
//!
//! The five core subsystems: [`partition`] (page/segment
//! layer), [`group`] (size-group allocator, plus [`big`] for objects larger
//! than the largest group), [`marker`] (conservative root scanning and gray
//! drain), [`write_vector`] (the write barrier and its SATB bookkeeping),
//! and [`collector`] (the flip/sweep/coalesce loop). [`heap`] ties all of it
//! together behind the embedding API in [`heap::RealtimeHeap`].

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

pub mod big;
pub mod collector;
pub mod config;
pub mod error;
pub mod group;
pub mod header;
pub mod heap;
pub mod marker;
pub mod metrics;
pub mod mutator;
pub mod partition;
pub mod roots;
pub mod tracing_support;
pub mod write_vector;

pub use config::HeapConfig;
pub use error::{GcError, GcResult};
pub use header::StorageClass;
pub use heap::{CollectorMode, RealtimeHeap};
pub use metrics::{CollectionType, GcMetrics};
