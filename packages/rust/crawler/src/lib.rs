//! HTTP research collaborator for the batch engine.
//!
//! [`HttpUnitFactory`] plugs into a `batchscout_core::ResourcePool`; every
//! pooled [`ResearchSession`] fetches a company site, ranks its links,
//! converts the chosen pages to Markdown and reports a JSON profile.

mod content;
mod fetch;
mod rank;
pub mod session;

pub use session::{
    Discovered, Extracted, ExtractedPage, HttpUnitFactory, ResearchSession, Selected, Traffic,
};
