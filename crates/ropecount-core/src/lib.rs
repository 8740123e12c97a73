//! # ropecount-core
//!
//! Core abstractions for the ropecount counter pipeline.
//!
//! This crate provides the foundational types and traits used by the
//! compactor service and its clients:
//!
//! - **Segments & Directions**: fixed-width time buckets and counter polarity
//! - **Key Codec**: canonical KV key names for counter sets and hash-maps
//! - **KV Abstraction**: the set/hash operations the compactor needs,
//!   with in-memory and Redis backends
//! - **Sink Abstraction**: durable upserts of aggregated counter records,
//!   with in-memory and `MongoDB` backends
//! - **Error Types**: shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `ropecount-core` is the **only** crate allowed to define shared
//! primitives. Services depend on the traits here and receive concrete
//! backends at construction time.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod counter_keys;
pub mod error;
pub mod kv;
pub mod observability;
pub mod segment;
pub mod sink;

pub use counter_keys::{KeyNames, PROCESSING_SUFFIX, ParsedKey, parse_key_name};
pub use error::{Error, Result};
pub use kv::{KV_NAMESPACE, KvStore, MemoryKv, RedisKv};
pub use observability::{LogFormat, init_logging};
pub use segment::{Direction, SEGMENT_DURATION_SECS, Segment};
pub use sink::{CompactionSink, MemorySink, MongoSink, SinkWrite};
