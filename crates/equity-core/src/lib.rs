//! Equity accounting for a founder/helper marketplace.
//!
//! Founders approve deal milestones; each approval appends one immutable grant to the
//! equity ledger and may cascade into completing the deal and closing its originating
//! post. Cap tables and portfolios are derived from the ledger on every read.

#![deny(unsafe_code)]

pub mod aggregation;
pub mod approval;
pub mod cascade;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;
pub mod types;

pub use aggregation::{
    build_cap_table, build_portfolio, CapTable, CapTableOrder, CapTableRow, Ownership, Portfolio,
    PortfolioRow,
};
pub use approval::authorize_approval;
pub use cascade::{cascade_after_approval, run_cascade, CascadeOutcome, CascadeReport};
pub use engine::{ApprovalOutcome, EquityEngine, EquityStorageConfig};
pub use error::{EquityError, EquityResult};
pub use ledger::{LedgerEntry, LedgerFilter, LedgerStore, NewLedgerEntry, MILESTONE_APPROVED_MEMO};
pub use memory::InMemoryEquityStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEquityStore;
pub use store::{
    ApprovalStore, DealCompletion, EquityStore, MarketplaceStore, MilestoneWithDeal,
    SettingsRegistry,
};
pub use types::{
    Business, BusinessId, Deal, DealId, DealStatus, DealView, EntryId, EquitySetting, Milestone,
    MilestoneId, MilestoneStatus, PostId, PostStatus, ProblemPost, Proposal, ProposalId,
    ProposalStatus, UserId, DEFAULT_INITIAL_GRANT_UNITS,
};
