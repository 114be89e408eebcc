//! Phase dependency graph.
//!
//! Phases form a total order by `ordinal`; explicit `depends_on` edges may
//! override it as long as the graph stays acyclic.
//!
//! ## Example
//!
//! ```
//! use waypoint::dag::DagBuilder;
//! use waypoint::phase::Phase;
//!
//! let phases = vec![
//!     Phase::new("build", "Build", 1),
//!     Phase::new("docs", "Docs", 0).with_depends_on(vec!["build".to_string()]),
//!     Phase::new("ship", "Ship", 2),
//! ];
//! let graph = DagBuilder::new(phases).build().unwrap();
//! assert_eq!(graph.execution_order(), vec!["build", "docs", "ship"]);
//! ```

mod builder;

pub use builder::{DagBuilder, PhaseGraph, PhaseIndex};
