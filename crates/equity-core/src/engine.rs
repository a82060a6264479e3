use crate::aggregation::{build_cap_table, build_portfolio, CapTable, CapTableOrder, Portfolio};
use crate::approval::authorize_approval;
use crate::cascade::{cascade_after_approval, run_cascade, CascadeOutcome, CascadeReport};
use crate::error::{EquityError, EquityResult};
use crate::ledger::{LedgerEntry, LedgerFilter};
use crate::memory::InMemoryEquityStore;
use crate::store::EquityStore;
use crate::types::{
    Business, BusinessId, Deal, DealId, DealView, EquitySetting, Milestone, MilestoneId, PostId,
    ProblemPost, Proposal, ProposalId, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Storage backend configuration.
#[derive(Debug, Clone, Default)]
pub enum EquityStorageConfig {
    /// Keep every record in process memory only.
    #[default]
    Memory,
    /// Persist everything in PostgreSQL. Requires the `postgres` feature.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl EquityStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Result of a committed milestone approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub milestone_id: MilestoneId,
    pub ledger_entry: LedgerEntry,
    pub cascade: CascadeReport,
}

/// Entry point for every equity operation.
///
/// The engine owns no state of its own; all guarded transitions are delegated to the
/// backing [`EquityStore`], so several engines may safely share one database.
#[derive(Clone)]
pub struct EquityEngine {
    store: Arc<dyn EquityStore>,
}

impl EquityEngine {
    pub fn new(store: Arc<dyn EquityStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryEquityStore::new()))
    }

    pub async fn bootstrap(config: EquityStorageConfig) -> EquityResult<Self> {
        match config {
            EquityStorageConfig::Memory => Ok(Self::in_memory()),
            #[cfg(feature = "postgres")]
            EquityStorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store =
                    crate::postgres::PostgresEquityStore::connect(&database_url, max_connections)
                        .await?;
                Ok(Self::new(Arc::new(store)))
            }
            #[cfg(not(feature = "postgres"))]
            EquityStorageConfig::Postgres { .. } => Err(EquityError::storage(
                "equity-core was built without the postgres feature",
            )),
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.store.backend_label()
    }

    pub fn store(&self) -> &Arc<dyn EquityStore> {
        &self.store
    }

    pub async fn create_business(
        &self,
        owner_id: UserId,
        name: impl Into<String>,
    ) -> EquityResult<Business> {
        let business = Business::new(owner_id, name)?;
        self.store.insert_business(business.clone()).await?;
        info!(business_id = %business.id, owner_id = %owner_id, "business created");
        Ok(business)
    }

    /// Set the unit denominator for a business. Settings are write-once and may not be
    /// smaller than what the ledger has already granted; the store checks both atomically.
    pub async fn configure_equity(
        &self,
        business_id: BusinessId,
        actor: UserId,
        total_units: u64,
    ) -> EquityResult<EquitySetting> {
        self.require_owner(business_id, actor).await?;
        let setting = EquitySetting::new(business_id, total_units)?;
        self.store.insert_equity_setting(setting.clone()).await?;
        info!(business_id = %business_id, total_units, "equity settings configured");
        Ok(setting)
    }

    pub async fn create_post(
        &self,
        business_id: BusinessId,
        actor: UserId,
        title: impl Into<String>,
    ) -> EquityResult<ProblemPost> {
        self.require_owner(business_id, actor).await?;
        let post = ProblemPost::new(business_id, title)?;
        self.store.insert_post(post.clone()).await?;
        info!(business_id = %business_id, post_id = %post.id, "problem post opened");
        Ok(post)
    }

    /// A helper offers to take on an open post, optionally asking for an initial grant.
    pub async fn submit_proposal(
        &self,
        post_id: PostId,
        actor: UserId,
        deliverables: Option<String>,
        timeline_days: Option<u32>,
        equity_ask: Option<u64>,
    ) -> EquityResult<Proposal> {
        let post = self.load_post(post_id).await?;
        let business = self
            .store
            .business(post.business_id)
            .await?
            .ok_or_else(|| {
                EquityError::NotFound(format!("business {} not found", post.business_id))
            })?;
        if business.owner_id == actor {
            return Err(EquityError::InvalidInput(
                "a founder cannot propose on their own post".to_string(),
            ));
        }

        let proposal = Proposal::new(post_id, actor, deliverables, timeline_days, equity_ask)?;
        self.store.insert_proposal(proposal.clone()).await?;
        info!(
            proposal_id = %proposal.id,
            post_id = %post_id,
            proposed_by = %actor,
            "proposal submitted"
        );
        Ok(proposal)
    }

    pub async fn proposals(&self, post_id: PostId) -> EquityResult<Vec<Proposal>> {
        self.load_post(post_id).await?;
        self.store.proposals_for_post(post_id).await
    }

    /// Accept a pending proposal: it becomes `accepted`, the post becomes `matched`, and a
    /// deal opens with an initial milestone worth the proposal's ask (default 10).
    pub async fn accept_proposal(
        &self,
        proposal_id: ProposalId,
        actor: UserId,
    ) -> EquityResult<DealView> {
        let proposal = self.load_proposal(proposal_id).await?;
        let post = self.load_post(proposal.post_id).await?;
        self.require_owner(post.business_id, actor).await?;

        let deal = Deal::new(post.business_id, actor, proposal.proposed_by, Some(post.id))?;
        let initial = Milestone::initial(deal.id, proposal.equity_ask)?;
        self.store
            .open_deal(proposal_id, deal.clone(), initial.clone())
            .await?;

        info!(
            proposal_id = %proposal_id,
            deal_id = %deal.id,
            post_id = %post.id,
            helper_id = %deal.helper_id,
            initial_units = initial.equity_grant_units,
            "proposal accepted"
        );
        Ok(DealView {
            deal,
            milestones: vec![initial],
        })
    }

    pub async fn reject_proposal(
        &self,
        proposal_id: ProposalId,
        actor: UserId,
    ) -> EquityResult<Proposal> {
        let proposal = self.load_proposal(proposal_id).await?;
        let post = self.load_post(proposal.post_id).await?;
        self.require_owner(post.business_id, actor).await?;

        let rejected = self.store.reject_proposal(proposal_id).await?;
        info!(proposal_id = %proposal_id, post_id = %post.id, "proposal rejected");
        Ok(rejected)
    }

    pub async fn add_milestone(
        &self,
        deal_id: DealId,
        actor: UserId,
        title: impl Into<String>,
        acceptance_criteria: Option<String>,
        equity_grant_units: u64,
    ) -> EquityResult<Milestone> {
        let view = self.load_deal(deal_id).await?;
        require_founder(&view.deal, actor)?;

        let milestone = Milestone::new(deal_id, title, acceptance_criteria, equity_grant_units)?;
        self.store.insert_milestone(milestone.clone()).await?;
        info!(
            deal_id = %deal_id,
            milestone_id = %milestone.id,
            units = equity_grant_units,
            "milestone added"
        );
        Ok(milestone)
    }

    pub async fn deal(&self, deal_id: DealId) -> EquityResult<DealView> {
        self.load_deal(deal_id).await
    }

    /// Approve a milestone on behalf of `actor`.
    ///
    /// The status flip and the ledger append commit together. The completion cascade runs
    /// afterwards; its failure is reported in the outcome and never undoes the approval.
    pub async fn approve_milestone(
        &self,
        milestone_id: MilestoneId,
        actor: UserId,
    ) -> EquityResult<ApprovalOutcome> {
        let loaded = self.store.milestone_with_deal(milestone_id).await?;
        let grant = authorize_approval(milestone_id, loaded.as_ref(), actor)?;
        let business_id = grant.business_id;

        // `authorize_approval` fails on `None`, so the deal is present here.
        let Some(loaded) = loaded else {
            return Err(EquityError::NotFound(format!(
                "milestone {} not found",
                milestone_id
            )));
        };

        let entry = self.store.commit_approval(milestone_id, grant).await?;
        info!(
            milestone_id = %milestone_id,
            deal_id = %loaded.deal.id,
            recipient = %entry.recipient_user_id,
            units = entry.units,
            ledger_entry_id = %entry.id,
            "milestone approved"
        );

        self.warn_if_over_allocated(business_id).await;

        let cascade = cascade_after_approval(self.store.as_ref(), &loaded.deal).await;
        Ok(ApprovalOutcome {
            milestone_id,
            ledger_entry: entry,
            cascade,
        })
    }

    /// Re-run the completion cascade for a deal, e.g. after a reported cascade failure.
    pub async fn run_cascade(
        &self,
        deal_id: DealId,
        actor: UserId,
    ) -> EquityResult<CascadeOutcome> {
        let view = self.load_deal(deal_id).await?;
        require_founder(&view.deal, actor)?;
        run_cascade(self.store.as_ref(), &view.deal).await
    }

    pub async fn ledger_entries(&self, filter: LedgerFilter) -> EquityResult<Vec<LedgerEntry>> {
        self.store.list_entries(&filter).await
    }

    pub async fn cap_table(
        &self,
        business_id: BusinessId,
        order: CapTableOrder,
    ) -> EquityResult<CapTable> {
        if self.store.business(business_id).await?.is_none() {
            return Err(EquityError::NotFound(format!(
                "business {} not found",
                business_id
            )));
        }
        let entries = self
            .store
            .list_entries(&LedgerFilter::business(business_id))
            .await?;
        let setting = self.store.equity_setting(business_id).await?;
        Ok(build_cap_table(business_id, &entries, setting.as_ref(), order))
    }

    pub async fn portfolio(&self, recipient_user_id: UserId) -> EquityResult<Portfolio> {
        let entries = self
            .store
            .list_entries(&LedgerFilter::recipient(recipient_user_id))
            .await?;
        let businesses = entries
            .iter()
            .map(|entry| entry.business_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let settings = self.store.equity_settings(&businesses).await?;
        Ok(build_portfolio(recipient_user_id, &entries, &settings))
    }

    async fn load_deal(&self, deal_id: DealId) -> EquityResult<DealView> {
        self.store
            .deal(deal_id)
            .await?
            .ok_or_else(|| EquityError::NotFound(format!("deal {} not found", deal_id)))
    }

    async fn load_post(&self, post_id: PostId) -> EquityResult<ProblemPost> {
        self.store
            .post(post_id)
            .await?
            .ok_or_else(|| EquityError::NotFound(format!("post {} not found", post_id)))
    }

    async fn load_proposal(&self, proposal_id: ProposalId) -> EquityResult<Proposal> {
        self.store
            .proposal(proposal_id)
            .await?
            .ok_or_else(|| EquityError::NotFound(format!("proposal {} not found", proposal_id)))
    }

    async fn require_owner(&self, business_id: BusinessId, actor: UserId) -> EquityResult<Business> {
        let business = self
            .store
            .business(business_id)
            .await?
            .ok_or_else(|| EquityError::NotFound(format!("business {} not found", business_id)))?;
        if business.owner_id != actor {
            return Err(EquityError::Forbidden(format!(
                "user {} does not own business {}",
                actor, business_id
            )));
        }
        Ok(business)
    }

    async fn granted_units(&self, business_id: BusinessId) -> EquityResult<u64> {
        let entries = self
            .store
            .list_entries(&LedgerFilter::business(business_id))
            .await?;
        Ok(entries
            .iter()
            .fold(0u64, |acc, entry| acc.saturating_add(entry.units)))
    }

    async fn warn_if_over_allocated(&self, business_id: BusinessId) {
        let setting = match self.store.equity_setting(business_id).await {
            Ok(Some(setting)) => setting,
            Ok(None) => return,
            Err(err) => {
                warn!(business_id = %business_id, error = %err, "over-allocation check skipped");
                return;
            }
        };
        match self.granted_units(business_id).await {
            Ok(granted) if granted > setting.total_units => {
                warn!(
                    business_id = %business_id,
                    granted,
                    total_units = setting.total_units,
                    "granted units exceed configured total"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(business_id = %business_id, error = %err, "over-allocation check skipped");
            }
        }
    }
}

fn require_founder(deal: &Deal, actor: UserId) -> EquityResult<()> {
    if deal.is_founder(actor) {
        Ok(())
    } else {
        Err(EquityError::Forbidden(format!(
            "user {} is not the founder of deal {}",
            actor, deal.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DealStatus, MilestoneStatus, PostStatus, ProposalStatus};

    struct Marketplace {
        engine: EquityEngine,
        founder: UserId,
        helper: UserId,
        business: Business,
        post: ProblemPost,
    }

    async fn marketplace() -> Marketplace {
        let engine = EquityEngine::in_memory();
        let founder = UserId::generate();
        let helper = UserId::generate();
        let business = engine.create_business(founder, "Acme Robotics").await.unwrap();
        engine
            .configure_equity(business.id, founder, 100)
            .await
            .unwrap();
        let post = engine
            .create_post(business.id, founder, "Fix the gripper firmware")
            .await
            .unwrap();
        Marketplace {
            engine,
            founder,
            helper,
            business,
            post,
        }
    }

    impl Marketplace {
        async fn deal_with_ask(&self, equity_ask: Option<u64>) -> DealView {
            let proposal = self
                .engine
                .submit_proposal(self.post.id, self.helper, None, None, equity_ask)
                .await
                .unwrap();
            self.engine
                .accept_proposal(proposal.id, self.founder)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn accept_proposal_defaults_to_ten_units() {
        let m = marketplace().await;
        let view = m.deal_with_ask(None).await;
        assert_eq!(view.milestones.len(), 1);
        assert_eq!(view.milestones[0].equity_grant_units, 10);
        assert_eq!(view.deal.post_id, Some(m.post.id));
        assert_eq!(view.deal.helper_id, m.helper);

        let post = m.engine.store().post(m.post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Matched);
        let proposals = m.engine.proposals(m.post.id).await.unwrap();
        assert_eq!(proposals[0].status, ProposalStatus::Accepted);
    }

    #[tokio::test]
    async fn proposal_lifecycle() {
        let m = marketplace().await;
        let rival = UserId::generate();
        let first = m
            .engine
            .submit_proposal(
                m.post.id,
                rival,
                Some("  Rewrite the driver  ".to_string()),
                Some(14),
                Some(30),
            )
            .await
            .unwrap();
        assert_eq!(first.deliverables.as_deref(), Some("Rewrite the driver"));
        assert_eq!(first.status, ProposalStatus::Pending);

        let second = m
            .engine
            .submit_proposal(m.post.id, m.helper, None, None, Some(12))
            .await
            .unwrap();

        let rejected = m.engine.reject_proposal(first.id, m.founder).await.unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);
        assert!(matches!(
            m.engine.accept_proposal(first.id, m.founder).await,
            Err(EquityError::Conflict(_))
        ));

        let view = m.engine.accept_proposal(second.id, m.founder).await.unwrap();
        assert_eq!(view.milestones[0].equity_grant_units, 12);
        assert!(matches!(
            m.engine.reject_proposal(second.id, m.founder).await,
            Err(EquityError::Conflict(_))
        ));

        // The post is matched now; late proposals are refused.
        assert!(matches!(
            m.engine
                .submit_proposal(m.post.id, UserId::generate(), None, None, None)
                .await,
            Err(EquityError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn founder_cannot_propose_on_own_post() {
        let m = marketplace().await;
        assert!(matches!(
            m.engine
                .submit_proposal(m.post.id, m.founder, None, None, None)
                .await,
            Err(EquityError::InvalidInput(_))
        ));
        assert!(matches!(
            m.engine
                .submit_proposal(PostId::generate(), m.helper, None, None, None)
                .await,
            Err(EquityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn only_the_owner_manages_the_business() {
        let m = marketplace().await;
        let stranger = UserId::generate();
        assert!(matches!(
            m.engine.create_post(m.business.id, stranger, "Spam").await,
            Err(EquityError::Forbidden(_))
        ));

        let proposal = m
            .engine
            .submit_proposal(m.post.id, m.helper, None, None, None)
            .await
            .unwrap();
        assert!(matches!(
            m.engine.accept_proposal(proposal.id, stranger).await,
            Err(EquityError::Forbidden(_))
        ));
        assert!(matches!(
            m.engine.reject_proposal(proposal.id, m.helper).await,
            Err(EquityError::Forbidden(_))
        ));
        assert!(matches!(
            m.engine.accept_proposal(ProposalId::generate(), m.founder).await,
            Err(EquityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn single_milestone_approval_completes_deal_and_closes_post() {
        let m = marketplace().await;
        let view = m.deal_with_ask(Some(15)).await;

        let outcome = m
            .engine
            .approve_milestone(view.milestones[0].id, m.founder)
            .await
            .unwrap();
        assert_eq!(outcome.ledger_entry.units, 15);
        assert_eq!(outcome.ledger_entry.memo, "Milestone approved");
        match outcome.cascade {
            CascadeReport::Applied(ref cascade) => {
                assert!(cascade.deal_completed_now);
                assert_eq!(cascade.post_closed, Some(m.post.id));
            }
            ref other => panic!("unexpected cascade report: {other:?}"),
        }

        let deal = m.engine.deal(view.deal.id).await.unwrap();
        assert_eq!(deal.deal.status, DealStatus::Completed);
        assert_eq!(deal.milestones[0].status, MilestoneStatus::Approved);

        let cap = m
            .engine
            .cap_table(m.business.id, CapTableOrder::Units)
            .await
            .unwrap();
        let row = cap.holder(m.helper).unwrap();
        assert_eq!(row.units, 15);
        assert_eq!(row.ownership.as_ref().unwrap().percent, "15.00");
    }

    #[tokio::test]
    async fn cap_table_of_unknown_business_is_not_found() {
        let m = marketplace().await;
        assert!(matches!(
            m.engine
                .cap_table(BusinessId::generate(), CapTableOrder::Units)
                .await,
            Err(EquityError::NotFound(_))
        ));

        // A known business with no grants yields an empty table.
        let cap = m
            .engine
            .cap_table(m.business.id, CapTableOrder::Units)
            .await
            .unwrap();
        assert!(cap.holders.is_empty());
    }

    #[tokio::test]
    async fn second_approval_conflicts() {
        let m = marketplace().await;
        let view = m.deal_with_ask(None).await;
        let id = view.milestones[0].id;
        m.engine.approve_milestone(id, m.founder).await.unwrap();

        let err = m.engine.approve_milestone(id, m.founder).await.unwrap_err();
        assert!(matches!(err, EquityError::Conflict(_)));
        let entries = m
            .engine
            .ledger_entries(LedgerFilter::deal(view.deal.id))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn settings_cannot_shrink_below_granted_units() {
        let engine = EquityEngine::in_memory();
        let founder = UserId::generate();
        let helper = UserId::generate();
        let business = engine.create_business(founder, "Unconfigured").await.unwrap();
        let post = engine
            .create_post(business.id, founder, "Landing page")
            .await
            .unwrap();
        let proposal = engine
            .submit_proposal(post.id, helper, None, None, Some(40))
            .await
            .unwrap();
        let view = engine.accept_proposal(proposal.id, founder).await.unwrap();
        engine
            .approve_milestone(view.milestones[0].id, founder)
            .await
            .unwrap();

        let err = engine
            .configure_equity(business.id, founder, 39)
            .await
            .unwrap_err();
        assert!(matches!(err, EquityError::InvalidInput(_)));
        engine
            .configure_equity(business.id, founder, 40)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn portfolio_spans_businesses() {
        let m = marketplace().await;
        let first = m.deal_with_ask(Some(25)).await;
        m.engine
            .approve_milestone(first.milestones[0].id, m.founder)
            .await
            .unwrap();

        let other_founder = UserId::generate();
        let other = m
            .engine
            .create_business(other_founder, "Side project")
            .await
            .unwrap();
        let post = m
            .engine
            .create_post(other.id, other_founder, "Logo")
            .await
            .unwrap();
        let proposal = m
            .engine
            .submit_proposal(post.id, m.helper, None, None, Some(5))
            .await
            .unwrap();
        let second = m
            .engine
            .accept_proposal(proposal.id, other_founder)
            .await
            .unwrap();
        m.engine
            .approve_milestone(second.milestones[0].id, other_founder)
            .await
            .unwrap();

        let portfolio = m.engine.portfolio(m.helper).await.unwrap();
        assert_eq!(portfolio.total_units_held, 30);
        assert_eq!(
            portfolio
                .business(m.business.id)
                .unwrap()
                .ownership
                .as_ref()
                .unwrap()
                .percent,
            "25.00"
        );
        assert!(portfolio.business(other.id).unwrap().ownership.is_none());
    }
}
