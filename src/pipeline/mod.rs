//! Job-mail classification pipeline.
//!
//! Every inbound message flows through:
//! 1. `extract` — provider payload or RFC 822 into a canonical `RawMessage`
//! 2. `correlation` — sender and domain recency against prior decisions
//! 3. `rules` and `classifier` — ordered rules, statistical fallback, overrides
//! 4. `company` + `alias` — four-tier resolution, always alias-resolved
//! 5. `dates` — label-conditioned status dates
//!
//! `processor::IngestionPipeline` wires the stages together and emits one
//! `DecisionRecord` per message.

pub mod alias;
pub mod classifier;
pub mod company;
pub mod correlation;
pub mod dates;
pub mod extract;
pub mod model;
pub mod patterns;
pub mod processor;
pub mod rules;
pub mod types;

pub use processor::IngestionPipeline;
