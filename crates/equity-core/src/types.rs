use crate::error::{EquityError, EquityResult};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Largest unit count any record may carry; keeps values inside a PostgreSQL `BIGINT`.
pub const MAX_UNITS: u64 = i64::MAX as u64;

/// Grant used for the initial milestone when a proposal carries no equity ask.
pub const DEFAULT_INITIAL_GRANT_UNITS: u64 = 10;

pub const INITIAL_MILESTONE_TITLE: &str = "Initial milestone";
pub const INITIAL_MILESTONE_CRITERIA: &str = "Deliverables confirmed and accepted.";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID. The nil UUID is never a valid identifier.
            pub fn from_uuid(id: Uuid) -> EquityResult<Self> {
                if id.is_nil() {
                    return Err(EquityError::InvalidInput(format!(
                        "{} must not be the nil uuid",
                        $label
                    )));
                }
                Ok(Self(id))
            }

            pub fn parse(value: &str) -> EquityResult<Self> {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(EquityError::InvalidInput(format!("{} is required", $label)));
                }
                let id = Uuid::parse_str(trimmed).map_err(|_| {
                    EquityError::InvalidInput(format!("{} '{}' is not a valid uuid", $label, trimmed))
                })?;
                Self::from_uuid(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identity of a marketplace user (founder or helper).
    UserId,
    "user_id"
);
uuid_id!(BusinessId, "business_id");
uuid_id!(DealId, "deal_id");
uuid_id!(MilestoneId, "milestone_id");
uuid_id!(PostId, "post_id");
uuid_id!(ProposalId, "proposal_id");
uuid_id!(EntryId, "entry_id");

/// Current time at the precision PostgreSQL `TIMESTAMPTZ` stores.
pub(crate) fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn validate_units(field: &str, units: u64) -> EquityResult<u64> {
    if units > MAX_UNITS {
        return Err(EquityError::InvalidInput(format!(
            "{} {} exceeds the maximum of {}",
            field, units, MAX_UNITS
        )));
    }
    Ok(units)
}

fn required_text(field: &str, value: impl Into<String>) -> EquityResult<String> {
    let value = value.into();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EquityError::InvalidInput(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Approved,
}

impl MilestoneStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
        }
    }

    pub fn parse(value: &str) -> EquityResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            other => Err(EquityError::storage(format!(
                "unknown milestone status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Active,
    Completed,
}

impl DealStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> EquityResult<Self> {
        match value {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(EquityError::storage(format!("unknown deal status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Open,
    Matched,
    Closed,
}

impl PostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Matched => "matched",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> EquityResult<Self> {
        match value {
            "open" => Ok(Self::Open),
            "matched" => Ok(Self::Matched),
            "closed" => Ok(Self::Closed),
            other => Err(EquityError::storage(format!("unknown post status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> EquityResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(EquityError::storage(format!(
                "unknown proposal status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: BusinessId,
    pub name: String,
    /// The founder allowed to configure equity and accept proposals.
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Business {
    pub fn new(owner_id: UserId, name: impl Into<String>) -> EquityResult<Self> {
        Ok(Self {
            id: BusinessId::generate(),
            name: required_text("name", name)?,
            owner_id,
            created_at: now_micros(),
        })
    }
}

/// Per-business denominator for ownership percentages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquitySetting {
    pub business_id: BusinessId,
    pub total_units: u64,
    pub updated_at: DateTime<Utc>,
}

impl EquitySetting {
    pub fn new(business_id: BusinessId, total_units: u64) -> EquityResult<Self> {
        if total_units == 0 {
            return Err(EquityError::InvalidInput(
                "total_units must be positive".to_string(),
            ));
        }
        Ok(Self {
            business_id,
            total_units: validate_units("total_units", total_units)?,
            updated_at: now_micros(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemPost {
    pub id: PostId,
    pub business_id: BusinessId,
    pub title: String,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
}

impl ProblemPost {
    pub fn new(business_id: BusinessId, title: impl Into<String>) -> EquityResult<Self> {
        Ok(Self {
            id: PostId::generate(),
            business_id,
            title: required_text("title", title)?,
            status: PostStatus::Open,
            created_at: now_micros(),
        })
    }
}

/// A helper's offer to solve a post in exchange for equity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub post_id: PostId,
    pub proposed_by: UserId,
    pub deliverables: Option<String>,
    pub timeline_days: Option<u32>,
    /// Units requested for the initial milestone; the default grant applies when absent.
    pub equity_ask: Option<u64>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(
        post_id: PostId,
        proposed_by: UserId,
        deliverables: Option<String>,
        timeline_days: Option<u32>,
        equity_ask: Option<u64>,
    ) -> EquityResult<Self> {
        Ok(Self {
            id: ProposalId::generate(),
            post_id,
            proposed_by,
            deliverables: optional_text(deliverables),
            timeline_days,
            equity_ask: equity_ask
                .map(|units| validate_units("equity_ask", units))
                .transpose()?,
            status: ProposalStatus::Pending,
            created_at: now_micros(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub status: DealStatus,
    pub business_id: BusinessId,
    pub founder_id: UserId,
    pub helper_id: UserId,
    pub post_id: Option<PostId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deal {
    pub fn new(
        business_id: BusinessId,
        founder_id: UserId,
        helper_id: UserId,
        post_id: Option<PostId>,
    ) -> EquityResult<Self> {
        if founder_id == helper_id {
            return Err(EquityError::InvalidInput(
                "a founder cannot take a deal as its own helper".to_string(),
            ));
        }
        Ok(Self {
            id: DealId::generate(),
            status: DealStatus::Active,
            business_id,
            founder_id,
            helper_id,
            post_id,
            created_at: now_micros(),
            completed_at: None,
        })
    }

    pub fn is_founder(&self, user_id: UserId) -> bool {
        self.founder_id == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub deal_id: DealId,
    pub title: String,
    pub acceptance_criteria: Option<String>,
    /// Fixed at creation; the ledger entry written on approval carries exactly this amount.
    pub equity_grant_units: u64,
    pub status: MilestoneStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl Milestone {
    pub fn new(
        deal_id: DealId,
        title: impl Into<String>,
        acceptance_criteria: Option<String>,
        equity_grant_units: u64,
    ) -> EquityResult<Self> {
        Ok(Self {
            id: MilestoneId::generate(),
            deal_id,
            title: required_text("title", title)?,
            acceptance_criteria: optional_text(acceptance_criteria),
            equity_grant_units: validate_units("equity_grant_units", equity_grant_units)?,
            status: MilestoneStatus::Pending,
            created_at: now_micros(),
            approved_at: None,
        })
    }

    /// The milestone a deal starts with when a founder accepts a proposal.
    pub fn initial(deal_id: DealId, equity_ask: Option<u64>) -> EquityResult<Self> {
        Self::new(
            deal_id,
            INITIAL_MILESTONE_TITLE,
            Some(INITIAL_MILESTONE_CRITERIA.to_string()),
            equity_ask.unwrap_or(DEFAULT_INITIAL_GRANT_UNITS),
        )
    }

    pub fn is_approved(&self) -> bool {
        self.status == MilestoneStatus::Approved
    }
}

/// A deal together with its milestones in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealView {
    pub deal: Deal,
    pub milestones: Vec<Milestone>,
}

impl DealView {
    pub fn open_milestones(&self) -> usize {
        self.milestones.iter().filter(|m| !m.is_approved()).count()
    }

    pub fn approved_units(&self) -> u64 {
        self.milestones
            .iter()
            .filter(|m| m.is_approved())
            .fold(0u64, |acc, m| acc.saturating_add(m.equity_grant_units))
    }
}
