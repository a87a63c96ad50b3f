//! A variable-aware statistical profiler for native executables.
//!
//! Beyond the classical PC histogram and call-graph arc counts a
//! gprof-style profiler records, this crate additionally samples the
//! runtime values of source-level variables on every profiling tick,
//! correlating each sample with the program counter, thread, timestamp,
//! and (optionally) a short caller unwind. Which variables are worth
//! sampling is decided ahead of time by the sibling `knobprof-irpass`
//! compiler pass, not by this crate at runtime.
//!
//! The runtime is split into the pieces named in the design:
//!
//! - [`location`] -- the DWARF-2 location-expression evaluator (§4.A).
//! - [`hashtable`] -- fixed-stride PC-to-bucket hashing (§4.B).
//! - [`config`] -- the startup config loader (§4.C).
//! - [`sampler`] -- the SIGPROF hot path (§4.D).
//! - [`recorder`] -- call-graph arc recording (§4.E).
//! - [`writer`] -- process lifecycle and artifact serialization (§4.F).
//!
//! Everything reachable from the SIGPROF handler avoids allocation and
//! locking (§5); fallible setup code returns [`error::ProfError`] instead.

#[macro_use]
extern crate log;

pub mod arena;
pub mod config;
pub mod context;
pub mod error;
pub mod hashtable;
pub mod location;
pub mod phdr;
pub mod recorder;
pub mod sampler;
pub mod storage;
pub mod unwind;
pub mod writer;

pub use error::{ProfError, Result};
pub use writer::{is_error, mcleanup, mcount, monstartup, ProfilerOptions};
