use crate::error::EquityResult;
use crate::store::{ApprovalStore, DealCompletion};
use crate::types::{Deal, DealId, DealStatus, PostId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What a cascade pass observed and changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeOutcome {
    pub deal_id: DealId,
    pub deal_status: DealStatus,
    pub open_milestones: usize,
    /// `true` only for the pass that moved the deal to `completed`.
    pub deal_completed_now: bool,
    /// Set when this pass moved the originating post to `closed`.
    pub post_closed: Option<PostId>,
}

/// Cascade status reported alongside a committed approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CascadeReport {
    Applied(CascadeOutcome),
    /// The approval stands; the cascade can be re-run for this deal.
    Failed { deal_id: DealId, error: String },
}

impl CascadeReport {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Propagates "all milestones approved" from a deal up to its originating post.
///
/// Idempotent: re-running against a completed deal with a closed post changes nothing, and
/// re-running after a partial failure finishes the remaining steps.
pub async fn run_cascade<S>(store: &S, deal: &Deal) -> EquityResult<CascadeOutcome>
where
    S: ApprovalStore + ?Sized,
{
    let completion = store.complete_deal_if_settled(deal.id).await?;

    let (deal_status, open_milestones, deal_completed_now) = match completion {
        DealCompletion::Completed => {
            info!(deal_id = %deal.id, "deal completed: all milestones approved");
            (DealStatus::Completed, 0, true)
        }
        DealCompletion::AlreadyCompleted => (DealStatus::Completed, 0, false),
        DealCompletion::MilestonesOpen { open } => {
            debug!(deal_id = %deal.id, open, "deal still has pending milestones");
            return Ok(CascadeOutcome {
                deal_id: deal.id,
                deal_status: DealStatus::Active,
                open_milestones: open,
                deal_completed_now: false,
                post_closed: None,
            });
        }
    };

    let mut post_closed = None;
    if let Some(post_id) = deal.post_id {
        if store.close_post(post_id).await? {
            info!(deal_id = %deal.id, post_id = %post_id, "originating post closed");
            post_closed = Some(post_id);
        }
    }

    Ok(CascadeOutcome {
        deal_id: deal.id,
        deal_status,
        open_milestones,
        deal_completed_now,
        post_closed,
    })
}

/// Run the cascade after a committed approval, converting failures into a report.
pub async fn cascade_after_approval<S>(store: &S, deal: &Deal) -> CascadeReport
where
    S: ApprovalStore + ?Sized,
{
    match run_cascade(store, deal).await {
        Ok(outcome) => CascadeReport::Applied(outcome),
        Err(err) => {
            warn!(
                deal_id = %deal.id,
                error = %err,
                "completion cascade failed after committed approval; re-run the cascade for this deal"
            );
            CascadeReport::Failed {
                deal_id: deal.id,
                error: err.to_string(),
            }
        }
    }
}
