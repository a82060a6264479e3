//! Storage contract for the equity subsystem.
//!
//! Every mutating method is a single unit of work: implementations either apply all of
//! its effects or none of them. Backends in this crate:
//! - [`crate::memory::InMemoryEquityStore`] for tests and local runs
//! - `crate::postgres::PostgresEquityStore` (feature `postgres`) as the source of truth

use crate::error::EquityResult;
use crate::ledger::{LedgerEntry, LedgerStore, NewLedgerEntry};
use crate::types::{
    Business, BusinessId, Deal, DealId, DealView, EquitySetting, Milestone, MilestoneId, PostId,
    ProblemPost, Proposal, ProposalId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A milestone loaded together with the deal it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneWithDeal {
    pub milestone: Milestone,
    pub deal: Deal,
}

/// Result of asking storage to complete a deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DealCompletion {
    /// This call moved the deal from `active` to `completed`.
    Completed,
    /// The deal was already `completed`; nothing changed.
    AlreadyCompleted,
    /// Milestones are still pending; nothing changed.
    MilestonesOpen { open: usize },
}

/// Per-business equity configuration.
#[async_trait]
pub trait SettingsRegistry: Send + Sync {
    async fn equity_setting(&self, business_id: BusinessId) -> EquityResult<Option<EquitySetting>>;

    /// Settings for every listed business that has one.
    async fn equity_settings(
        &self,
        business_ids: &[BusinessId],
    ) -> EquityResult<Vec<EquitySetting>>;

    /// Write-once: fails with `Conflict` when the business is already configured, and with
    /// `InvalidInput` when `total_units` is below the units already granted. The bound is
    /// checked in the same unit of work as the write, so no approval can commit in between.
    async fn insert_equity_setting(&self, setting: EquitySetting) -> EquityResult<()>;
}

/// Businesses, posts, deals and milestones.
#[async_trait]
pub trait MarketplaceStore: Send + Sync {
    async fn insert_business(&self, business: Business) -> EquityResult<()>;

    async fn business(&self, business_id: BusinessId) -> EquityResult<Option<Business>>;

    async fn insert_post(&self, post: ProblemPost) -> EquityResult<()>;

    async fn post(&self, post_id: PostId) -> EquityResult<Option<ProblemPost>>;

    /// Record a pending proposal. The post must exist and still be `open`.
    async fn insert_proposal(&self, proposal: Proposal) -> EquityResult<()>;

    async fn proposal(&self, proposal_id: ProposalId) -> EquityResult<Option<Proposal>>;

    /// Proposals for a post, newest first.
    async fn proposals_for_post(&self, post_id: PostId) -> EquityResult<Vec<Proposal>>;

    /// Move a `pending` proposal to `rejected`; anything else is a `Conflict`.
    async fn reject_proposal(&self, proposal_id: ProposalId) -> EquityResult<Proposal>;

    /// Accept `proposal_id` by opening `deal` with its first milestone.
    ///
    /// In one unit of work: the proposal must be `pending` for the deal's post and helper and
    /// becomes `accepted`; the post must still be `open` and becomes `matched`; the deal and
    /// milestone are inserted.
    async fn open_deal(
        &self,
        proposal_id: ProposalId,
        deal: Deal,
        initial: Milestone,
    ) -> EquityResult<()>;

    /// Add a milestone to a deal that is still `active`.
    async fn insert_milestone(&self, milestone: Milestone) -> EquityResult<()>;

    async fn deal(&self, deal_id: DealId) -> EquityResult<Option<DealView>>;

    async fn milestone_with_deal(
        &self,
        milestone_id: MilestoneId,
    ) -> EquityResult<Option<MilestoneWithDeal>>;
}

/// Guarded transitions driven by milestone approval.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Flip the milestone from `pending` to `approved` and append `grant` atomically.
    ///
    /// The status check is a compare-and-swap against current storage state: of any number
    /// of concurrent calls for one milestone, at most one succeeds and the rest see
    /// `Conflict`. If the append fails the status flip is rolled back.
    async fn commit_approval(
        &self,
        milestone_id: MilestoneId,
        grant: NewLedgerEntry,
    ) -> EquityResult<LedgerEntry>;

    /// Re-read the deal's milestones and move it to `completed` if none are pending.
    async fn complete_deal_if_settled(&self, deal_id: DealId) -> EquityResult<DealCompletion>;

    /// Mark the post `closed`. Returns `false` when it was already closed.
    async fn close_post(&self, post_id: PostId) -> EquityResult<bool>;
}

/// Everything the equity engine needs from a backend.
pub trait EquityStore:
    LedgerStore + SettingsRegistry + MarketplaceStore + ApprovalStore + Send + Sync
{
    fn backend_label(&self) -> &'static str;
}
