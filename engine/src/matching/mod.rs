//! Key-based matching engine.
//!
//! ```text
//!  left ──▶ key ──▶ lookup(right) ──▶ match?    ──▶ copy columns / MatchAction
//!                                  └─ no match ──▶ NoMatchAction
//! ```
//!
//! - [`LookupMatch`] - Expand, Join and KeyTest over an eagerly built lookup
//! - [`CustomExpand`] - Expand with a caller-supplied match selector
//! - [`DeferredMatch`] - the same shapes resolved batch by batch against a
//!   right-hand provider, with a result cache

mod actions;
mod deferred;
mod eager;
mod lookup;

pub use actions::{
    ColumnCopy, MatchAction, MatchHandler, MatchKind, MatchRules, NoMatchAction, NoMatchHandler,
};
pub use deferred::{DeferredMatch, DeferredOptions, DeferredStats, RightProvider};
pub use eager::{CustomExpand, LookupMatch, MatchSelector};
pub use lookup::{Insert, LookupMode, LookupTable};
