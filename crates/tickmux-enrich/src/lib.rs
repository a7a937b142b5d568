//! tickmux-enrich — quota-governed enrichment.
//!
//! - [`QuotaGovernor`] — rolling-minute ceiling plus a per-call-type TTL cache
//! - [`Enricher`] — cache → quota → [`LookupService`] with stale fallback
//! - [`should_analyze`] — pure candidate pre-filter
//! - [`Batcher`] / [`run_batched`] — paced processing of queued work

pub mod batch;
pub mod filter;
pub mod governor;
pub mod lookup;

pub use batch::{run_batched, BatchStats, BatchWorker, Batcher};
pub use filter::{should_analyze, Candidate, FilterConfig};
pub use governor::{BudgetReport, QuotaGovernor, QuotaStatus};
pub use lookup::{Enricher, HttpLookup, LookupService};
