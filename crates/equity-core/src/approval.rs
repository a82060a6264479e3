use crate::error::{EquityError, EquityResult};
use crate::ledger::NewLedgerEntry;
use crate::store::MilestoneWithDeal;
use crate::types::{MilestoneId, MilestoneStatus, UserId};

impl MilestoneStatus {
    /// The only legal transition: `pending -> approved`, exactly once.
    pub fn approve(self, milestone_id: MilestoneId) -> EquityResult<MilestoneStatus> {
        match self {
            MilestoneStatus::Pending => Ok(MilestoneStatus::Approved),
            MilestoneStatus::Approved => Err(EquityError::already_approved(milestone_id)),
        }
    }
}

/// Pre-commit checks for `ApproveMilestone`, applied in order:
/// 1. the milestone and its deal exist
/// 2. the acting user is the deal's founder
/// 3. the milestone is still pending
///
/// On success returns the grant to write. Step 3 is re-checked atomically by
/// [`crate::store::ApprovalStore::commit_approval`]; this read only rejects early.
pub fn authorize_approval(
    milestone_id: MilestoneId,
    loaded: Option<&MilestoneWithDeal>,
    actor: UserId,
) -> EquityResult<NewLedgerEntry> {
    let loaded = loaded
        .ok_or_else(|| EquityError::NotFound(format!("milestone {} not found", milestone_id)))?;

    if !loaded.deal.is_founder(actor) {
        return Err(EquityError::Forbidden(format!(
            "user {} is not the founder of deal {}",
            actor, loaded.deal.id
        )));
    }

    loaded.milestone.status.approve(milestone_id)?;

    NewLedgerEntry::milestone_grant(&loaded.deal, &loaded.milestone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BusinessId, Deal, Milestone};

    fn loaded(status: MilestoneStatus) -> MilestoneWithDeal {
        let deal = Deal::new(
            BusinessId::generate(),
            UserId::generate(),
            UserId::generate(),
            None,
        )
        .unwrap();
        let mut milestone = Milestone::new(deal.id, "Design review", None, 40).unwrap();
        milestone.status = status;
        MilestoneWithDeal { milestone, deal }
    }

    #[test]
    fn approves_pending_milestone_for_founder() {
        let view = loaded(MilestoneStatus::Pending);
        let grant =
            authorize_approval(view.milestone.id, Some(&view), view.deal.founder_id).unwrap();
        assert_eq!(grant.units, 40);
        assert_eq!(grant.recipient_user_id, view.deal.helper_id);
    }

    #[test]
    fn missing_milestone_is_not_found() {
        let err = authorize_approval(MilestoneId::generate(), None, UserId::generate())
            .unwrap_err();
        assert!(matches!(err, EquityError::NotFound(_)));
    }

    #[test]
    fn helper_cannot_approve_own_work() {
        let view = loaded(MilestoneStatus::Pending);
        let err =
            authorize_approval(view.milestone.id, Some(&view), view.deal.helper_id).unwrap_err();
        assert!(matches!(err, EquityError::Forbidden(_)));
    }

    #[test]
    fn authorization_is_checked_before_status() {
        let view = loaded(MilestoneStatus::Approved);
        let err =
            authorize_approval(view.milestone.id, Some(&view), UserId::generate()).unwrap_err();
        assert!(matches!(err, EquityError::Forbidden(_)));
    }

    #[test]
    fn approved_milestone_is_a_conflict() {
        let view = loaded(MilestoneStatus::Approved);
        let err =
            authorize_approval(view.milestone.id, Some(&view), view.deal.founder_id).unwrap_err();
        assert!(matches!(err, EquityError::Conflict(_)));
    }

    #[test]
    fn status_transition_happens_once() {
        let id = MilestoneId::generate();
        let next = MilestoneStatus::Pending.approve(id).unwrap();
        assert_eq!(next, MilestoneStatus::Approved);
        assert!(next.approve(id).is_err());
    }
}
