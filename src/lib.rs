//! # Weir Stream Engine
//!
//! A stream-processing engine for operational time-series and event data:
//! clients declare a DAG of named operators in an SQL-like language, the
//! engine types and compiles the graph, then runs one worker process per
//! node, routing tuples through memory-mapped SPSC ring buffers.
//!
//! ## Pipeline
//!
//! ```text
//! Operation Source Code
//!     |
//! [parser]      -> Operation AST
//!     |
//! [typing]      -> typed AST + input/output tuple schemas (fixed point)
//!     |
//! [graph]       -> signatures, per-signature compiled artifacts
//!     |
//! [supervisor]  -> ring buffers + one worker process per node
//!     |
//! [runtime]     -> group map, commit/flush/slide, generators, top-k
//!     |
//! [export]      -> retained tuple windows, time-series queries
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Scalar types, values, the widening lattice |
//! | `schema` | Expression types and tuple schemas |
//! | `expr` | Expression and operation ASTs, canonical printing |
//! | `parser` | SQL-like surface -> AST |
//! | `typing` | Bidirectional fixed-point type inference |
//! | `graph` | Layers, nodes, signatures, persistence |
//! | `ring` | Memory-mapped SPSC ring buffer |
//! | `codec` | Tuple <-> u32-word wire codec |
//! | `eval` | Tree-walking evaluator over typed ASTs |
//! | `runtime` | Operator runtimes and the window state machine |
//! | `worker` | Worker process entry and I/O loop |
//! | `supervisor` | Layer lifecycle: compile / run / stop / reap |
//! | `export` | Tuple retention and time-series slicing |
//! | `novelty` | Sliced Bloom filter behind REMEMBER |
//! | `api` | HTTP control surface |

pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod eval;
pub mod export;
pub mod expr;
pub mod graph;
pub mod novelty;
pub mod parser;
pub mod ring;
pub mod runtime;
pub mod schema;
pub mod supervisor;
pub mod typing;
pub mod value;
pub mod worker;

pub use config::Config;
pub use error::{Result, WeirError};
pub use graph::{Graph, Layer, LayerStatus, Node};
pub use supervisor::{LayerDef, NodeDef, Supervisor};
pub use value::{ScalarType, Tuple, Value};
