//! Offline debug converter and traffic analyzer for the NPM agent (spec.md §4.7), plus the
//! JSON shape the live debug HTTP endpoint and the offline CLI subcommands share.

pub mod analyzer;
pub mod converter;
pub mod error;
pub mod snapshot;

pub use analyzer::{analyze, get_input_type, Endpoint, InputType, TrafficTuple, Verdict};
pub use converter::{convert, Direction, ResolvedMatch, ResolvedRule, ResolvedSetMatch, ResolvedTarget};
pub use error::{Error, Result};
pub use snapshot::DebugManagerResponse;
