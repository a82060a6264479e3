use crate::error::{EquityError, EquityResult};
use crate::types::{
    now_micros, validate_units, BusinessId, Deal, DealId, EntryId, Milestone, MilestoneId, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MILESTONE_APPROVED_MEMO: &str = "Milestone approved";

/// An immutable equity grant.
///
/// The ledger is the only source of truth for units held: cap tables and portfolios are
/// folds over these records and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub business_id: BusinessId,
    pub recipient_user_id: UserId,
    pub deal_id: DealId,
    pub milestone_id: MilestoneId,
    pub units: u64,
    pub memo: String,
    pub created_at: DateTime<Utc>,
    /// BLAKE3 digest over the fields above.
    pub digest: String,
}

impl LedgerEntry {
    pub fn verify_digest(&self) -> bool {
        compute_entry_digest(
            &self.id,
            &self.business_id,
            &self.recipient_user_id,
            &self.deal_id,
            &self.milestone_id,
            self.units,
            &self.memo,
            self.created_at,
        ) == self.digest
    }
}

/// A grant that has not been written yet. Identity, timestamp and digest are assigned
/// when the entry is sealed by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub business_id: BusinessId,
    pub recipient_user_id: UserId,
    pub deal_id: DealId,
    pub milestone_id: MilestoneId,
    pub units: u64,
    pub memo: String,
}

impl NewLedgerEntry {
    pub fn new(
        business_id: BusinessId,
        recipient_user_id: UserId,
        deal_id: DealId,
        milestone_id: MilestoneId,
        units: u64,
        memo: impl Into<String>,
    ) -> EquityResult<Self> {
        let memo = memo.into();
        if memo.trim().is_empty() {
            return Err(EquityError::InvalidInput(
                "ledger memo is required".to_string(),
            ));
        }
        Ok(Self {
            business_id,
            recipient_user_id,
            deal_id,
            milestone_id,
            units: validate_units("units", units)?,
            memo,
        })
    }

    /// The grant written when `milestone` of `deal` is approved: the helper receives
    /// exactly the milestone's fixed grant in the deal's business.
    pub fn milestone_grant(deal: &Deal, milestone: &Milestone) -> EquityResult<Self> {
        if milestone.deal_id != deal.id {
            return Err(EquityError::InvalidInput(format!(
                "milestone {} does not belong to deal {}",
                milestone.id, deal.id
            )));
        }
        Self::new(
            deal.business_id,
            deal.helper_id,
            deal.id,
            milestone.id,
            milestone.equity_grant_units,
            MILESTONE_APPROVED_MEMO,
        )
    }

    pub fn seal(self) -> LedgerEntry {
        let id = EntryId::generate();
        let created_at = now_micros();
        let digest = compute_entry_digest(
            &id,
            &self.business_id,
            &self.recipient_user_id,
            &self.deal_id,
            &self.milestone_id,
            self.units,
            &self.memo,
            created_at,
        );
        LedgerEntry {
            id,
            business_id: self.business_id,
            recipient_user_id: self.recipient_user_id,
            deal_id: self.deal_id,
            milestone_id: self.milestone_id,
            units: self.units,
            memo: self.memo,
            created_at,
            digest,
        }
    }
}

/// Read filter for ledger listings. Empty fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFilter {
    pub business_id: Option<BusinessId>,
    pub recipient_user_id: Option<UserId>,
    pub deal_id: Option<DealId>,
}

impl LedgerFilter {
    pub fn business(business_id: BusinessId) -> Self {
        Self {
            business_id: Some(business_id),
            ..Self::default()
        }
    }

    pub fn recipient(recipient_user_id: UserId) -> Self {
        Self {
            recipient_user_id: Some(recipient_user_id),
            ..Self::default()
        }
    }

    pub fn deal(deal_id: DealId) -> Self {
        Self {
            deal_id: Some(deal_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.business_id.map_or(true, |id| entry.business_id == id)
            && self
                .recipient_user_id
                .map_or(true, |id| entry.recipient_user_id == id)
            && self.deal_id.map_or(true, |id| entry.deal_id == id)
    }
}

/// Append-only equity ledger.
///
/// There is no update or delete method: once `append_entry` returns, the
/// entry is permanent. Uniqueness per milestone is the approval state machine's job.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Seal and persist one entry, returning the stored record.
    async fn append_entry(&self, entry: NewLedgerEntry) -> EquityResult<LedgerEntry>;

    /// Entries matching `filter`, oldest first.
    async fn list_entries(&self, filter: &LedgerFilter) -> EquityResult<Vec<LedgerEntry>>;
}

#[allow(clippy::too_many_arguments)]
fn compute_entry_digest(
    id: &EntryId,
    business_id: &BusinessId,
    recipient_user_id: &UserId,
    deal_id: &DealId,
    milestone_id: &MilestoneId,
    units: u64,
    memo: &str,
    created_at: DateTime<Utc>,
) -> String {
    let material = serde_json::json!({
        "id": id,
        "business_id": business_id,
        "recipient_user_id": recipient_user_id,
        "deal_id": deal_id,
        "milestone_id": milestone_id,
        "units": units,
        "memo": memo,
        "created_at": created_at.timestamp_micros(),
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_deal() -> Deal {
        Deal::new(
            BusinessId::generate(),
            UserId::generate(),
            UserId::generate(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn milestone_grant_pays_the_helper_the_fixed_amount() {
        let deal = sample_deal();
        let milestone = Milestone::new(deal.id, "Launch", None, 75).unwrap();

        let draft = NewLedgerEntry::milestone_grant(&deal, &milestone).unwrap();
        assert_eq!(draft.business_id, deal.business_id);
        assert_eq!(draft.recipient_user_id, deal.helper_id);
        assert_eq!(draft.milestone_id, milestone.id);
        assert_eq!(draft.units, 75);
        assert_eq!(draft.memo, MILESTONE_APPROVED_MEMO);
    }

    #[test]
    fn milestone_grant_rejects_foreign_milestone() {
        let deal = sample_deal();
        let other = Milestone::new(DealId::generate(), "Elsewhere", None, 5).unwrap();
        assert!(NewLedgerEntry::milestone_grant(&deal, &other).is_err());
    }

    #[test]
    fn sealed_entries_carry_a_verifiable_digest() {
        let deal = sample_deal();
        let milestone = Milestone::new(deal.id, "Launch", None, 12).unwrap();
        let entry = NewLedgerEntry::milestone_grant(&deal, &milestone)
            .unwrap()
            .seal();
        assert!(entry.verify_digest());
        assert_eq!(entry.created_at.timestamp_subsec_nanos() % 1_000, 0);

        let mut tampered = entry.clone();
        tampered.units = 1_000;
        assert!(!tampered.verify_digest());
    }

    #[test]
    fn filter_matches_on_every_populated_field() {
        let deal = sample_deal();
        let milestone = Milestone::new(deal.id, "Launch", None, 12).unwrap();
        let entry = NewLedgerEntry::milestone_grant(&deal, &milestone)
            .unwrap()
            .seal();

        assert!(LedgerFilter::default().matches(&entry));
        assert!(LedgerFilter::business(deal.business_id).matches(&entry));
        assert!(LedgerFilter::recipient(deal.helper_id).matches(&entry));
        assert!(!LedgerFilter::recipient(deal.founder_id).matches(&entry));

        let mixed = LedgerFilter {
            business_id: Some(deal.business_id),
            recipient_user_id: Some(deal.helper_id),
            deal_id: Some(DealId::generate()),
        };
        assert!(!mixed.matches(&entry));
    }
}
