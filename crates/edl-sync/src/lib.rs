//! Entity resolution between the inspection dataset and the business directory:
//! similarity scoring, per-pass matchers, cursor-driven pulls and the link run.

pub mod config;
pub mod coordinator;
pub mod matcher;
pub mod pipeline;
pub mod similarity;

pub use config::{LinkConfig, MatchingConfig};
pub use coordinator::{PullCoordinator, PullError, Pulled};
pub use matcher::{ByAddressMatcher, ByPhoneMatcher, CandidateScore, ExtractMatcher};
pub use pipeline::{
    connect_db, init_db, run_link, run_link_from_env, LinkPipeline, LinkRequest, LinkRunSummary,
    PassSummary,
};
pub use similarity::similarity;

pub const CRATE_NAME: &str = "edl-sync";
