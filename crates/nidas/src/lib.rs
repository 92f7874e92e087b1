// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # NIDAS - In-situ Data-Acquisition Sample Pipeline
//!
//! The in-process core of a distributed data-acquisition system for
//! atmospheric research platforms: time-tagged variable-length samples,
//! fan-out from sensors through processors to sinks, time alignment of
//! asynchronous streams, and a byte-exact archive format with a
//! recoverable ASCII header.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Acquisition Layer                           |
//! |   PortSelector (poll thread) -> Sensor -> scanner -> raw samples   |
//! +--------------------------------------------------------------------+
//! |                        Processing Layer                            |
//! |   process() | AdaptiveDespiker | SampleSorter | NearestResampler   |
//! |   SyncRecordSource (per-second aligned float records)              |
//! +--------------------------------------------------------------------+
//! |                        Distribution Layer                          |
//! |   SampleSourceSupport fan-out | SampleArchiver | output streams    |
//! +--------------------------------------------------------------------+
//! |                        Transport Layer                             |
//! |   IOStream over File | FileSet | Socket | McSocket | Pty | Unix    |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Sample`] | Reference-counted, time-tagged, typed record |
//! | [`SamplePool`] | Process-wide freelist allocator for payload buffers |
//! | [`SampleTag`] | Schema of one sample stream: id, rate, variables |
//! | [`PortSelector`] | Per-DSM poll loop over sensor descriptors |
//! | [`SampleSorter`] | Bounded re-ordering of samples by timetag |
//! | [`NearestResampler`] | Multi-rate alignment around a master variable |
//! | [`SyncRecordSource`] | Per-second float records with lag slots |
//! | [`SampleArchiver`] | Connects sources to rolling-file/socket outputs |
//!
//! ## Concurrency
//!
//! Threads, not async: one selector thread per DSM, a worker per sorter, a
//! reconnect thread per archiver. Samples are not globally ordered between
//! threads; ordering is imposed at the sort stage. Signal handling and
//! ordered teardown live in [`runtime::Runtime`].

/// Archive stream format: ASCII header + 16-byte little-endian frames.
pub mod archive;
/// The archiver: fans samples to a set of reconnecting outputs.
pub mod archiver;
/// Compile-time constants and swappable runtime configuration.
pub mod config;
/// Closed error taxonomy.
pub mod error;
/// Framed sample input streams.
pub mod input;
/// Byte transports and buffered streams.
pub mod io;
/// Framed sample output streams.
pub mod output;
/// Ordering stages.
pub mod pipeline;
/// Alignment, aggregation and screening processors.
pub mod process;
/// Process-wide runtime: signals, teardown.
pub mod runtime;
/// Samples, pools, tags, variables.
pub mod sample;
/// Sensors, scanners and the acquisition poll loop.
pub mod sensor;
/// Source/client fan-out.
pub mod source;
/// Timetag helpers.
pub mod time;

pub use archive::{ArchiveHeader, SampleHeader};
pub use archiver::SampleArchiver;
pub use error::{Error, Result};
pub use input::SampleInputStream;
pub use io::{IOChannel, IOStream};
pub use output::SampleOutputStream;
pub use pipeline::{OverflowPolicy, SampleSorter, SorterConfig};
pub use process::{AdaptiveDespiker, NearestResampler, SyncRecordReader, SyncRecordSource};
pub use runtime::Runtime;
pub use sample::tag::{Converter, SampleTag, VarType, Variable};
pub use sample::{Sample, SampleBuf, SampleData, SampleId, SamplePool, SampleType};
pub use sensor::{CharacterSensor, PortSelector, RecordFraming, SeparatorPosition};
pub use source::{SampleClient, SampleSource, SampleSourceSupport};
pub use time::DsmTime;
