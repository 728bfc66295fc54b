//! Campaign planner: expands a campaign definition into a deterministic,
//! totally ordered list of concrete runs.
//!
//! Planning is a pure function of (config, catalog): the same inputs always
//! produce the same key set, so replanning an existing campaign is a no-op
//! once the ledger absorbs the duplicate keys.

pub mod catalog;
pub mod filter;
pub mod plan;
pub mod quant;
pub mod size;

pub use catalog::{HttpCatalog, ModelCatalog, StaticCatalog};
pub use filter::{filter_quant_names, glob_match};
pub use plan::{plan_campaign, PlanOutcome, PlanSkip, PlannedRunSpec};
pub use quant::{extract_quant_name, group_gguf_files, GgufQuantInfo};
pub use size::{estimate_quant_size_gb, parse_params};
