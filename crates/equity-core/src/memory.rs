//! In-memory reference implementation of the equity storage traits.
//!
//! All state sits behind one lock, so every trait method is trivially a single unit of
//! work. Production deployments should use the PostgreSQL backend.

use crate::error::{EquityError, EquityResult};
use crate::ledger::{LedgerEntry, LedgerFilter, LedgerStore, NewLedgerEntry};
use crate::store::{
    ApprovalStore, DealCompletion, EquityStore, MarketplaceStore, MilestoneWithDeal,
    SettingsRegistry,
};
use crate::types::{
    now_micros, Business, BusinessId, Deal, DealId, DealStatus, DealView, EquitySetting,
    Milestone, MilestoneId, PostId, PostStatus, ProblemPost, Proposal, ProposalId,
    ProposalStatus,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct MemoryState {
    businesses: HashMap<BusinessId, Business>,
    settings: HashMap<BusinessId, EquitySetting>,
    posts: HashMap<PostId, ProblemPost>,
    proposals: HashMap<ProposalId, Proposal>,
    deals: HashMap<DealId, Deal>,
    milestones: HashMap<MilestoneId, Milestone>,
    /// Milestone ids per deal, in creation order.
    deal_milestones: HashMap<DealId, Vec<MilestoneId>>,
    ledger: Vec<LedgerEntry>,
}

impl MemoryState {
    fn milestones_of(&self, deal_id: DealId) -> Vec<Milestone> {
        self.deal_milestones
            .get(&deal_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.milestones.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory equity store.
#[derive(Debug, Default)]
pub struct InMemoryEquityStore {
    state: RwLock<MemoryState>,
}

impl InMemoryEquityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> EquityResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| EquityError::storage("equity state lock poisoned"))
    }

    fn write(&self) -> EquityResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| EquityError::storage("equity state lock poisoned"))
    }
}

#[async_trait]
impl LedgerStore for InMemoryEquityStore {
    async fn append_entry(&self, entry: NewLedgerEntry) -> EquityResult<LedgerEntry> {
        let sealed = entry.seal();
        self.write()?.ledger.push(sealed.clone());
        Ok(sealed)
    }

    async fn list_entries(&self, filter: &LedgerFilter) -> EquityResult<Vec<LedgerEntry>> {
        let guard = self.read()?;
        Ok(guard
            .ledger
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettingsRegistry for InMemoryEquityStore {
    async fn equity_setting(&self, business_id: BusinessId) -> EquityResult<Option<EquitySetting>> {
        Ok(self.read()?.settings.get(&business_id).cloned())
    }

    async fn equity_settings(
        &self,
        business_ids: &[BusinessId],
    ) -> EquityResult<Vec<EquitySetting>> {
        let guard = self.read()?;
        Ok(business_ids
            .iter()
            .filter_map(|id| guard.settings.get(id).cloned())
            .collect())
    }

    async fn insert_equity_setting(&self, setting: EquitySetting) -> EquityResult<()> {
        let mut guard = self.write()?;
        if !guard.businesses.contains_key(&setting.business_id) {
            return Err(EquityError::NotFound(format!(
                "business {} not found",
                setting.business_id
            )));
        }
        if guard.settings.contains_key(&setting.business_id) {
            return Err(EquityError::Conflict(format!(
                "equity settings for business {} already configured",
                setting.business_id
            )));
        }
        let granted = guard
            .ledger
            .iter()
            .filter(|entry| entry.business_id == setting.business_id)
            .fold(0u64, |acc, entry| acc.saturating_add(entry.units));
        if granted > setting.total_units {
            return Err(EquityError::InvalidInput(format!(
                "total_units {} is below the {} units already granted",
                setting.total_units, granted
            )));
        }
        guard.settings.insert(setting.business_id, setting);
        Ok(())
    }
}

#[async_trait]
impl MarketplaceStore for InMemoryEquityStore {
    async fn insert_business(&self, business: Business) -> EquityResult<()> {
        let mut guard = self.write()?;
        if guard.businesses.contains_key(&business.id) {
            return Err(EquityError::Conflict(format!(
                "business {} already exists",
                business.id
            )));
        }
        guard.businesses.insert(business.id, business);
        Ok(())
    }

    async fn business(&self, business_id: BusinessId) -> EquityResult<Option<Business>> {
        Ok(self.read()?.businesses.get(&business_id).cloned())
    }

    async fn insert_post(&self, post: ProblemPost) -> EquityResult<()> {
        let mut guard = self.write()?;
        if !guard.businesses.contains_key(&post.business_id) {
            return Err(EquityError::NotFound(format!(
                "business {} not found",
                post.business_id
            )));
        }
        if guard.posts.contains_key(&post.id) {
            return Err(EquityError::Conflict(format!("post {} already exists", post.id)));
        }
        guard.posts.insert(post.id, post);
        Ok(())
    }

    async fn post(&self, post_id: PostId) -> EquityResult<Option<ProblemPost>> {
        Ok(self.read()?.posts.get(&post_id).cloned())
    }

    async fn insert_proposal(&self, proposal: Proposal) -> EquityResult<()> {
        let mut guard = self.write()?;
        let post = guard.posts.get(&proposal.post_id).ok_or_else(|| {
            EquityError::NotFound(format!("post {} not found", proposal.post_id))
        })?;
        if post.status != PostStatus::Open {
            return Err(EquityError::Conflict(format!(
                "post {} is {}, not open",
                post.id,
                post.status.as_str()
            )));
        }
        if guard.proposals.contains_key(&proposal.id) {
            return Err(EquityError::Conflict(format!(
                "proposal {} already exists",
                proposal.id
            )));
        }
        guard.proposals.insert(proposal.id, proposal);
        Ok(())
    }

    async fn proposal(&self, proposal_id: ProposalId) -> EquityResult<Option<Proposal>> {
        Ok(self.read()?.proposals.get(&proposal_id).cloned())
    }

    async fn proposals_for_post(&self, post_id: PostId) -> EquityResult<Vec<Proposal>> {
        let guard = self.read()?;
        let mut proposals = guard
            .proposals
            .values()
            .filter(|p| p.post_id == post_id)
            .cloned()
            .collect::<Vec<_>>();
        proposals.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(proposals)
    }

    async fn reject_proposal(&self, proposal_id: ProposalId) -> EquityResult<Proposal> {
        let mut guard = self.write()?;
        let proposal = guard.proposals.get_mut(&proposal_id).ok_or_else(|| {
            EquityError::NotFound(format!("proposal {} not found", proposal_id))
        })?;
        if proposal.status != ProposalStatus::Pending {
            return Err(EquityError::Conflict(format!(
                "proposal {} is already {}",
                proposal_id,
                proposal.status.as_str()
            )));
        }
        proposal.status = ProposalStatus::Rejected;
        Ok(proposal.clone())
    }

    async fn open_deal(
        &self,
        proposal_id: ProposalId,
        deal: Deal,
        initial: Milestone,
    ) -> EquityResult<()> {
        let mut guard = self.write()?;
        if initial.deal_id != deal.id {
            return Err(EquityError::InvalidInput(format!(
                "initial milestone belongs to deal {}, not {}",
                initial.deal_id, deal.id
            )));
        }
        if !guard.businesses.contains_key(&deal.business_id) {
            return Err(EquityError::NotFound(format!(
                "business {} not found",
                deal.business_id
            )));
        }
        if guard.deals.contains_key(&deal.id) {
            return Err(EquityError::Conflict(format!("deal {} already exists", deal.id)));
        }

        let proposal = guard.proposals.get(&proposal_id).ok_or_else(|| {
            EquityError::NotFound(format!("proposal {} not found", proposal_id))
        })?;
        if deal.post_id != Some(proposal.post_id) || deal.helper_id != proposal.proposed_by {
            return Err(EquityError::InvalidInput(format!(
                "deal does not match proposal {}",
                proposal_id
            )));
        }
        if proposal.status != ProposalStatus::Pending {
            return Err(EquityError::Conflict(format!(
                "proposal {} is already {}",
                proposal_id,
                proposal.status.as_str()
            )));
        }

        let post_id = proposal.post_id;
        let post = guard
            .posts
            .get(&post_id)
            .ok_or_else(|| EquityError::NotFound(format!("post {} not found", post_id)))?;
        if post.business_id != deal.business_id {
            return Err(EquityError::InvalidInput(format!(
                "post {} belongs to a different business",
                post_id
            )));
        }
        if post.status != PostStatus::Open {
            return Err(EquityError::Conflict(format!(
                "post {} is {}, not open",
                post_id,
                post.status.as_str()
            )));
        }

        // Every check is above; the writes below land together.
        if let Some(post) = guard.posts.get_mut(&post_id) {
            post.status = PostStatus::Matched;
        }
        if let Some(proposal) = guard.proposals.get_mut(&proposal_id) {
            proposal.status = ProposalStatus::Accepted;
        }
        guard
            .deal_milestones
            .entry(deal.id)
            .or_default()
            .push(initial.id);
        guard.milestones.insert(initial.id, initial);
        guard.deals.insert(deal.id, deal);
        Ok(())
    }

    async fn insert_milestone(&self, milestone: Milestone) -> EquityResult<()> {
        let mut guard = self.write()?;
        let deal = guard.deals.get(&milestone.deal_id).ok_or_else(|| {
            EquityError::NotFound(format!("deal {} not found", milestone.deal_id))
        })?;
        if deal.status != DealStatus::Active {
            return Err(EquityError::Conflict(format!(
                "deal {} is completed; milestones can no longer be added",
                deal.id
            )));
        }
        if guard.milestones.contains_key(&milestone.id) {
            return Err(EquityError::Conflict(format!(
                "milestone {} already exists",
                milestone.id
            )));
        }
        guard
            .deal_milestones
            .entry(milestone.deal_id)
            .or_default()
            .push(milestone.id);
        guard.milestones.insert(milestone.id, milestone);
        Ok(())
    }

    async fn deal(&self, deal_id: DealId) -> EquityResult<Option<DealView>> {
        let guard = self.read()?;
        Ok(guard.deals.get(&deal_id).cloned().map(|deal| DealView {
            milestones: guard.milestones_of(deal_id),
            deal,
        }))
    }

    async fn milestone_with_deal(
        &self,
        milestone_id: MilestoneId,
    ) -> EquityResult<Option<MilestoneWithDeal>> {
        let guard = self.read()?;
        let Some(milestone) = guard.milestones.get(&milestone_id) else {
            return Ok(None);
        };
        Ok(guard
            .deals
            .get(&milestone.deal_id)
            .map(|deal| MilestoneWithDeal {
                milestone: milestone.clone(),
                deal: deal.clone(),
            }))
    }
}

#[async_trait]
impl ApprovalStore for InMemoryEquityStore {
    async fn commit_approval(
        &self,
        milestone_id: MilestoneId,
        grant: NewLedgerEntry,
    ) -> EquityResult<LedgerEntry> {
        let mut guard = self.write()?;
        let milestone = guard.milestones.get(&milestone_id).ok_or_else(|| {
            EquityError::NotFound(format!("milestone {} not found", milestone_id))
        })?;

        let next = milestone.status.approve(milestone_id)?;
        if grant.milestone_id != milestone_id
            || grant.deal_id != milestone.deal_id
            || grant.units != milestone.equity_grant_units
        {
            return Err(EquityError::InvalidInput(format!(
                "grant does not match milestone {}",
                milestone_id
            )));
        }

        // Every fallible step is above; the two writes below land together.
        let entry = grant.seal();
        if let Some(milestone) = guard.milestones.get_mut(&milestone_id) {
            milestone.status = next;
            milestone.approved_at = Some(entry.created_at);
        }
        guard.ledger.push(entry.clone());
        Ok(entry)
    }

    async fn complete_deal_if_settled(&self, deal_id: DealId) -> EquityResult<DealCompletion> {
        let mut guard = self.write()?;
        let status = guard
            .deals
            .get(&deal_id)
            .map(|deal| deal.status)
            .ok_or_else(|| EquityError::NotFound(format!("deal {} not found", deal_id)))?;
        if status == DealStatus::Completed {
            return Ok(DealCompletion::AlreadyCompleted);
        }

        let open = guard
            .milestones_of(deal_id)
            .iter()
            .filter(|m| !m.is_approved())
            .count();
        if open > 0 {
            return Ok(DealCompletion::MilestonesOpen { open });
        }

        if let Some(deal) = guard.deals.get_mut(&deal_id) {
            deal.status = DealStatus::Completed;
            deal.completed_at = Some(now_micros());
        }
        Ok(DealCompletion::Completed)
    }

    async fn close_post(&self, post_id: PostId) -> EquityResult<bool> {
        let mut guard = self.write()?;
        let post = guard
            .posts
            .get_mut(&post_id)
            .ok_or_else(|| EquityError::NotFound(format!("post {} not found", post_id)))?;
        if post.status == PostStatus::Closed {
            return Ok(false);
        }
        post.status = PostStatus::Closed;
        Ok(true)
    }
}

impl EquityStore for InMemoryEquityStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    struct Fixture {
        store: InMemoryEquityStore,
        deal: Deal,
        post: ProblemPost,
        milestone: Milestone,
    }

    async fn fixture(units: u64) -> Fixture {
        let store = InMemoryEquityStore::new();
        let founder = UserId::generate();
        let business = Business::new(founder, "Acme").unwrap();
        store.insert_business(business.clone()).await.unwrap();
        let post = ProblemPost::new(business.id, "Need a landing page").unwrap();
        store.insert_post(post.clone()).await.unwrap();

        let helper = UserId::generate();
        let proposal = Proposal::new(post.id, helper, None, None, Some(units)).unwrap();
        store.insert_proposal(proposal.clone()).await.unwrap();

        let deal = Deal::new(business.id, founder, helper, Some(post.id)).unwrap();
        let milestone = Milestone::initial(deal.id, proposal.equity_ask).unwrap();
        store
            .open_deal(proposal.id, deal.clone(), milestone.clone())
            .await
            .unwrap();

        Fixture {
            store,
            deal,
            post,
            milestone,
        }
    }

    #[tokio::test]
    async fn open_deal_accepts_the_proposal_and_matches_the_post() {
        let fx = fixture(10).await;
        let post = fx.store.post(fx.post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Matched);
        let proposals = fx.store.proposals_for_post(fx.post.id).await.unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].status, ProposalStatus::Accepted);

        // A matched post takes no new proposals.
        let late = Proposal::new(fx.post.id, UserId::generate(), None, None, None).unwrap();
        assert!(matches!(
            fx.store.insert_proposal(late).await,
            Err(EquityError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn rejected_proposal_cannot_open_a_deal() {
        let store = InMemoryEquityStore::new();
        let founder = UserId::generate();
        let business = Business::new(founder, "Acme").unwrap();
        store.insert_business(business.clone()).await.unwrap();
        let post = ProblemPost::new(business.id, "Need a logo").unwrap();
        store.insert_post(post.clone()).await.unwrap();
        let proposal = Proposal::new(post.id, UserId::generate(), None, None, Some(4)).unwrap();
        store.insert_proposal(proposal.clone()).await.unwrap();

        let rejected = store.reject_proposal(proposal.id).await.unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);
        assert!(matches!(
            store.reject_proposal(proposal.id).await,
            Err(EquityError::Conflict(_))
        ));

        let deal = Deal::new(business.id, founder, proposal.proposed_by, Some(post.id)).unwrap();
        let initial = Milestone::initial(deal.id, proposal.equity_ask).unwrap();
        let err = store
            .open_deal(proposal.id, deal.clone(), initial)
            .await
            .unwrap_err();
        assert!(matches!(err, EquityError::Conflict(_)));
        assert!(store.deal(deal.id).await.unwrap().is_none());
        assert_eq!(
            store.post(post.id).await.unwrap().unwrap().status,
            PostStatus::Open
        );
    }

    #[tokio::test]
    async fn open_deal_requires_the_proposing_helper() {
        let store = InMemoryEquityStore::new();
        let founder = UserId::generate();
        let business = Business::new(founder, "Acme").unwrap();
        store.insert_business(business.clone()).await.unwrap();
        let post = ProblemPost::new(business.id, "Need a logo").unwrap();
        store.insert_post(post.clone()).await.unwrap();
        let proposal = Proposal::new(post.id, UserId::generate(), None, None, None).unwrap();
        store.insert_proposal(proposal.clone()).await.unwrap();

        let deal = Deal::new(business.id, founder, UserId::generate(), Some(post.id)).unwrap();
        let initial = Milestone::initial(deal.id, None).unwrap();
        assert!(matches!(
            store.open_deal(proposal.id, deal, initial).await,
            Err(EquityError::InvalidInput(_))
        ));
        assert_eq!(
            store.proposal(proposal.id).await.unwrap().unwrap().status,
            ProposalStatus::Pending
        );
    }

    #[tokio::test]
    async fn commit_approval_is_compare_and_swap() {
        let fx = fixture(30).await;
        let grant = NewLedgerEntry::milestone_grant(&fx.deal, &fx.milestone).unwrap();

        let entry = fx
            .store
            .commit_approval(fx.milestone.id, grant.clone())
            .await
            .unwrap();
        assert_eq!(entry.units, 30);

        let err = fx
            .store
            .commit_approval(fx.milestone.id, grant)
            .await
            .unwrap_err();
        assert!(matches!(err, EquityError::Conflict(_)));

        let entries = fx.store.list_entries(&LedgerFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn mismatched_grant_leaves_milestone_pending() {
        let fx = fixture(30).await;
        let mut grant = NewLedgerEntry::milestone_grant(&fx.deal, &fx.milestone).unwrap();
        grant.units = 31;

        let err = fx
            .store
            .commit_approval(fx.milestone.id, grant)
            .await
            .unwrap_err();
        assert!(matches!(err, EquityError::InvalidInput(_)));

        let view = fx.store.deal(fx.deal.id).await.unwrap().unwrap();
        assert!(!view.milestones[0].is_approved());
        assert!(fx
            .store
            .list_entries(&LedgerFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn deal_completion_waits_for_every_milestone() {
        let fx = fixture(5).await;
        let extra = Milestone::new(fx.deal.id, "Follow-up", None, 7).unwrap();
        fx.store.insert_milestone(extra.clone()).await.unwrap();

        let grant = NewLedgerEntry::milestone_grant(&fx.deal, &fx.milestone).unwrap();
        fx.store
            .commit_approval(fx.milestone.id, grant)
            .await
            .unwrap();
        assert_eq!(
            fx.store.complete_deal_if_settled(fx.deal.id).await.unwrap(),
            DealCompletion::MilestonesOpen { open: 1 }
        );

        let grant = NewLedgerEntry::milestone_grant(&fx.deal, &extra).unwrap();
        fx.store.commit_approval(extra.id, grant).await.unwrap();
        assert_eq!(
            fx.store.complete_deal_if_settled(fx.deal.id).await.unwrap(),
            DealCompletion::Completed
        );
        assert_eq!(
            fx.store.complete_deal_if_settled(fx.deal.id).await.unwrap(),
            DealCompletion::AlreadyCompleted
        );

        let late = Milestone::new(fx.deal.id, "Too late", None, 1).unwrap();
        assert!(matches!(
            fx.store.insert_milestone(late).await,
            Err(EquityError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn close_post_is_idempotent() {
        let fx = fixture(5).await;
        assert!(fx.store.close_post(fx.post.id).await.unwrap());
        assert!(!fx.store.close_post(fx.post.id).await.unwrap());
        assert!(matches!(
            fx.store.close_post(PostId::generate()).await,
            Err(EquityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn settings_are_write_once() {
        let fx = fixture(5).await;
        let setting = EquitySetting::new(fx.deal.business_id, 1000).unwrap();
        fx.store.insert_equity_setting(setting.clone()).await.unwrap();
        assert!(matches!(
            fx.store.insert_equity_setting(setting).await,
            Err(EquityError::Conflict(_))
        ));

        let unknown = EquitySetting::new(BusinessId::generate(), 10).unwrap();
        assert!(matches!(
            fx.store.insert_equity_setting(unknown).await,
            Err(EquityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn settings_total_is_bounded_by_granted_units() {
        let fx = fixture(40).await;
        let grant = NewLedgerEntry::milestone_grant(&fx.deal, &fx.milestone).unwrap();
        fx.store
            .commit_approval(fx.milestone.id, grant)
            .await
            .unwrap();

        let too_small = EquitySetting::new(fx.deal.business_id, 39).unwrap();
        assert!(matches!(
            fx.store.insert_equity_setting(too_small).await,
            Err(EquityError::InvalidInput(_))
        ));
        assert!(fx
            .store
            .equity_setting(fx.deal.business_id)
            .await
            .unwrap()
            .is_none());

        let exact = EquitySetting::new(fx.deal.business_id, 40).unwrap();
        fx.store.insert_equity_setting(exact).await.unwrap();
    }
}
