//! PostgreSQL adapter for the equity subsystem.
//!
//! This is the transactional source of truth. Guarded transitions use row-level
//! compare-and-swap (`UPDATE ... WHERE status = ...`) or `SELECT ... FOR UPDATE` inside a
//! transaction, and the ledger table rejects `UPDATE`/`DELETE` with a trigger.

use crate::error::{EquityError, EquityResult};
use crate::ledger::{LedgerEntry, LedgerFilter, LedgerStore, NewLedgerEntry};
use crate::store::{
    ApprovalStore, DealCompletion, EquityStore, MarketplaceStore, MilestoneWithDeal,
    SettingsRegistry,
};
use crate::types::{
    now_micros, Business, BusinessId, Deal, DealId, DealStatus, DealView, EntryId, EquitySetting,
    Milestone, MilestoneId, MilestoneStatus, PostId, PostStatus, ProblemPost, Proposal,
    ProposalId, ProposalStatus, UserId,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

const DEAL_COLUMNS: &str =
    "id, status, business_id, founder_id, helper_id, post_id, created_at, completed_at";
const MILESTONE_COLUMNS: &str =
    "id, deal_id, title, acceptance_criteria, equity_grant_units, status, created_at, approved_at";
const PROPOSAL_COLUMNS: &str =
    "id, post_id, proposed_by, deliverables, timeline_days, equity_ask, status, created_at";
const ENTRY_COLUMNS: &str =
    "id, business_id, recipient_user_id, deal_id, milestone_id, units, memo, created_at, digest";

/// PostgreSQL-backed equity store.
#[derive(Debug, Clone)]
pub struct PostgresEquityStore {
    pool: PgPool,
}

impl PostgresEquityStore {
    /// Connect to PostgreSQL and initialize the schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> EquityResult<Self> {
        Self::connect_with_options(database_url, max_connections, 5).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> EquityResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| EquityError::storage(format!("postgres connect failed: {e}")))?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> EquityResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> EquityResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS businesses (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id UUID NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS business_equity_settings (
                business_id UUID PRIMARY KEY REFERENCES businesses (id),
                total_units BIGINT NOT NULL CHECK (total_units > 0),
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS problem_posts (
                id UUID PRIMARY KEY,
                business_id UUID NOT NULL REFERENCES businesses (id),
                title TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS proposals (
                id UUID PRIMARY KEY,
                post_id UUID NOT NULL REFERENCES problem_posts (id),
                proposed_by UUID NOT NULL,
                deliverables TEXT NULL,
                timeline_days INTEGER NULL CHECK (timeline_days >= 0),
                equity_ask BIGINT NULL CHECK (equity_ask >= 0),
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_proposals_post_id ON proposals (post_id)",
            r#"
            CREATE TABLE IF NOT EXISTS deals (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL,
                business_id UUID NOT NULL REFERENCES businesses (id),
                founder_id UUID NOT NULL,
                helper_id UUID NOT NULL,
                post_id UUID NULL REFERENCES problem_posts (id),
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deal_milestones (
                id UUID PRIMARY KEY,
                deal_id UUID NOT NULL REFERENCES deals (id),
                title TEXT NOT NULL,
                acceptance_criteria TEXT NULL,
                equity_grant_units BIGINT NOT NULL CHECK (equity_grant_units >= 0),
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                approved_at TIMESTAMPTZ NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_deal_milestones_deal_id ON deal_milestones (deal_id)",
            r#"
            CREATE TABLE IF NOT EXISTS equity_ledger_entries (
                id UUID PRIMARY KEY,
                business_id UUID NOT NULL,
                recipient_user_id UUID NOT NULL,
                deal_id UUID NOT NULL,
                milestone_id UUID NOT NULL,
                units BIGINT NOT NULL CHECK (units >= 0),
                memo TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                digest TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_equity_ledger_business ON equity_ledger_entries (business_id)",
            "CREATE INDEX IF NOT EXISTS idx_equity_ledger_recipient ON equity_ledger_entries (recipient_user_id)",
            "CREATE INDEX IF NOT EXISTS idx_equity_ledger_milestone ON equity_ledger_entries (milestone_id)",
            r#"
            CREATE OR REPLACE FUNCTION equity_ledger_reject_mutation() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION 'equity_ledger_entries is append-only';
            END;
            $$ LANGUAGE plpgsql
            "#,
            r#"
            DO $$
            BEGIN
                IF NOT EXISTS (
                    SELECT 1 FROM pg_trigger WHERE tgname = 'equity_ledger_append_only'
                ) THEN
                    CREATE TRIGGER equity_ledger_append_only
                        BEFORE UPDATE OR DELETE ON equity_ledger_entries
                        FOR EACH ROW EXECUTE FUNCTION equity_ledger_reject_mutation();
                END IF;
            END
            $$
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| EquityError::storage(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn begin(&self) -> EquityResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(backend)
    }
}

async fn insert_entry_in(
    tx: &mut Transaction<'static, Postgres>,
    entry: &LedgerEntry,
) -> EquityResult<()> {
    sqlx::query(
        r#"
        INSERT INTO equity_ledger_entries
            (id, business_id, recipient_user_id, deal_id, milestone_id, units, memo, created_at, digest)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.business_id.as_uuid())
    .bind(entry.recipient_user_id.as_uuid())
    .bind(entry.deal_id.as_uuid())
    .bind(entry.milestone_id.as_uuid())
    .bind(to_db_units(entry.units)?)
    .bind(&entry.memo)
    .bind(entry.created_at)
    .bind(&entry.digest)
    .execute(&mut **tx)
    .await
    .map_err(|e| EquityError::storage(format!("ledger insert failed: {e}")))?;
    Ok(())
}

async fn insert_milestone_in(
    tx: &mut Transaction<'static, Postgres>,
    milestone: &Milestone,
) -> EquityResult<()> {
    sqlx::query(
        r#"
        INSERT INTO deal_milestones
            (id, deal_id, title, acceptance_criteria, equity_grant_units, status, created_at, approved_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(milestone.id.as_uuid())
    .bind(milestone.deal_id.as_uuid())
    .bind(&milestone.title)
    .bind(&milestone.acceptance_criteria)
    .bind(to_db_units(milestone.equity_grant_units)?)
    .bind(milestone.status.as_str())
    .bind(milestone.created_at)
    .bind(milestone.approved_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_conflict)?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PostgresEquityStore {
    async fn append_entry(&self, entry: NewLedgerEntry) -> EquityResult<LedgerEntry> {
        let sealed = entry.seal();
        let mut tx = self.begin().await?;
        insert_entry_in(&mut tx, &sealed).await?;
        tx.commit().await.map_err(backend)?;
        Ok(sealed)
    }

    async fn list_entries(&self, filter: &LedgerFilter) -> EquityResult<Vec<LedgerEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
              FROM equity_ledger_entries
             WHERE ($1::uuid IS NULL OR business_id = $1)
               AND ($2::uuid IS NULL OR recipient_user_id = $2)
               AND ($3::uuid IS NULL OR deal_id = $3)
             ORDER BY created_at ASC, id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.business_id.map(|id| id.as_uuid()))
            .bind(filter.recipient_user_id.map(|id| id.as_uuid()))
            .bind(filter.deal_id.map(|id| id.as_uuid()))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(entry_from_row).collect()
    }
}

#[async_trait]
impl SettingsRegistry for PostgresEquityStore {
    async fn equity_setting(&self, business_id: BusinessId) -> EquityResult<Option<EquitySetting>> {
        let row = sqlx::query(
            "SELECT business_id, total_units, updated_at FROM business_equity_settings WHERE business_id = $1",
        )
        .bind(business_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(setting_from_row).transpose()
    }

    async fn equity_settings(
        &self,
        business_ids: &[BusinessId],
    ) -> EquityResult<Vec<EquitySetting>> {
        if business_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = business_ids.iter().map(|id| id.as_uuid()).collect::<Vec<_>>();
        let rows = sqlx::query(
            "SELECT business_id, total_units, updated_at FROM business_equity_settings WHERE business_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(setting_from_row).collect()
    }

    async fn insert_equity_setting(&self, setting: EquitySetting) -> EquityResult<()> {
        let mut tx = self.begin().await?;

        // Approvals take this row FOR SHARE, so the granted sum cannot move under us.
        let exists = sqlx::query("SELECT 1 FROM businesses WHERE id = $1 FOR UPDATE")
            .bind(setting.business_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        if exists.is_none() {
            return Err(EquityError::NotFound(format!(
                "business {} not found",
                setting.business_id
            )));
        }

        let granted: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(units), 0)::BIGINT FROM equity_ledger_entries WHERE business_id = $1",
        )
        .bind(setting.business_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        let granted = from_db_units(granted)?;
        if granted > setting.total_units {
            return Err(EquityError::InvalidInput(format!(
                "total_units {} is below the {} units already granted",
                setting.total_units, granted
            )));
        }

        sqlx::query(
            "INSERT INTO business_equity_settings (business_id, total_units, updated_at) VALUES ($1, $2, $3)",
        )
        .bind(setting.business_id.as_uuid())
        .bind(to_db_units(setting.total_units)?)
        .bind(setting.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl MarketplaceStore for PostgresEquityStore {
    async fn insert_business(&self, business: Business) -> EquityResult<()> {
        sqlx::query("INSERT INTO businesses (id, name, owner_id, created_at) VALUES ($1, $2, $3, $4)")
            .bind(business.id.as_uuid())
            .bind(&business.name)
            .bind(business.owner_id.as_uuid())
            .bind(business.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn business(&self, business_id: BusinessId) -> EquityResult<Option<Business>> {
        let row = sqlx::query("SELECT id, name, owner_id, created_at FROM businesses WHERE id = $1")
            .bind(business_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(business_from_row).transpose()
    }

    async fn insert_post(&self, post: ProblemPost) -> EquityResult<()> {
        sqlx::query(
            "INSERT INTO problem_posts (id, business_id, title, status, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(post.id.as_uuid())
        .bind(post.business_id.as_uuid())
        .bind(&post.title)
        .bind(post.status.as_str())
        .bind(post.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn post(&self, post_id: PostId) -> EquityResult<Option<ProblemPost>> {
        let row = sqlx::query(
            "SELECT id, business_id, title, status, created_at FROM problem_posts WHERE id = $1",
        )
        .bind(post_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn insert_proposal(&self, proposal: Proposal) -> EquityResult<()> {
        let timeline_days = proposal
            .timeline_days
            .map(i32::try_from)
            .transpose()
            .map_err(|_| EquityError::InvalidInput("timeline_days out of range".to_string()))?;
        let equity_ask = proposal.equity_ask.map(to_db_units).transpose()?;

        // The post must be open; the insert selects from it so both checks are one statement.
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO proposals ({PROPOSAL_COLUMNS})
            SELECT $1, p.id, $3, $4, $5, $6, $7, $8
              FROM problem_posts p
             WHERE p.id = $2 AND p.status = 'open'
            "#
        ))
        .bind(proposal.id.as_uuid())
        .bind(proposal.post_id.as_uuid())
        .bind(proposal.proposed_by.as_uuid())
        .bind(&proposal.deliverables)
        .bind(timeline_days)
        .bind(equity_ask)
        .bind(proposal.status.as_str())
        .bind(proposal.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        if inserted.rows_affected() > 0 {
            return Ok(());
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM problem_posts WHERE id = $1")
                .bind(proposal.post_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Err(match status {
            Some(status) => EquityError::Conflict(format!(
                "post {} is {}, not open",
                proposal.post_id, status
            )),
            None => EquityError::NotFound(format!("post {} not found", proposal.post_id)),
        })
    }

    async fn proposal(&self, proposal_id: ProposalId) -> EquityResult<Option<Proposal>> {
        let row = sqlx::query(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = $1"
        ))
        .bind(proposal_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(proposal_from_row).transpose()
    }

    async fn proposals_for_post(&self, post_id: PostId) -> EquityResult<Vec<Proposal>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE post_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(post_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(proposal_from_row).collect()
    }

    async fn reject_proposal(&self, proposal_id: ProposalId) -> EquityResult<Proposal> {
        let row = sqlx::query(&format!(
            "UPDATE proposals SET status = 'rejected' WHERE id = $1 AND status = 'pending' RETURNING {PROPOSAL_COLUMNS}"
        ))
        .bind(proposal_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        if let Some(row) = row {
            return proposal_from_row(&row);
        }

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM proposals WHERE id = $1")
            .bind(proposal_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Err(match status {
            Some(status) => {
                EquityError::Conflict(format!("proposal {} is already {}", proposal_id, status))
            }
            None => EquityError::NotFound(format!("proposal {} not found", proposal_id)),
        })
    }

    async fn open_deal(
        &self,
        proposal_id: ProposalId,
        deal: Deal,
        initial: Milestone,
    ) -> EquityResult<()> {
        if initial.deal_id != deal.id {
            return Err(EquityError::InvalidInput(format!(
                "initial milestone belongs to deal {}, not {}",
                initial.deal_id, deal.id
            )));
        }
        let Some(post_id) = deal.post_id else {
            return Err(EquityError::InvalidInput(format!(
                "deal does not match proposal {}",
                proposal_id
            )));
        };

        let mut tx = self.begin().await?;

        let accepted = sqlx::query(
            r#"
            UPDATE proposals
               SET status = 'accepted'
             WHERE id = $1
               AND post_id = $2
               AND proposed_by = $3
               AND status = 'pending'
            "#,
        )
        .bind(proposal_id.as_uuid())
        .bind(post_id.as_uuid())
        .bind(deal.helper_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if accepted.rows_affected() == 0 {
            let row = sqlx::query("SELECT post_id, proposed_by, status FROM proposals WHERE id = $1")
                .bind(proposal_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
            let Some(row) = row else {
                return Err(EquityError::NotFound(format!(
                    "proposal {} not found",
                    proposal_id
                )));
            };
            let proposal_post: Uuid = column(&row, "post_id")?;
            let proposed_by: Uuid = column(&row, "proposed_by")?;
            if proposal_post != post_id.as_uuid() || proposed_by != deal.helper_id.as_uuid() {
                return Err(EquityError::InvalidInput(format!(
                    "deal does not match proposal {}",
                    proposal_id
                )));
            }
            let status: String = column(&row, "status")?;
            return Err(EquityError::Conflict(format!(
                "proposal {} is already {}",
                proposal_id, status
            )));
        }

        let matched = sqlx::query(
            "UPDATE problem_posts SET status = 'matched' WHERE id = $1 AND business_id = $2 AND status = 'open'",
        )
        .bind(post_id.as_uuid())
        .bind(deal.business_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if matched.rows_affected() == 0 {
            let row = sqlx::query("SELECT business_id, status FROM problem_posts WHERE id = $1")
                .bind(post_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
            let Some(row) = row else {
                return Err(EquityError::NotFound(format!("post {} not found", post_id)));
            };
            let owner: Uuid = column(&row, "business_id")?;
            if owner != deal.business_id.as_uuid() {
                return Err(EquityError::InvalidInput(format!(
                    "post {} belongs to a different business",
                    post_id
                )));
            }
            let status: String = column(&row, "status")?;
            return Err(EquityError::Conflict(format!(
                "post {} is {}, not open",
                post_id, status
            )));
        }

        sqlx::query(&format!(
            "INSERT INTO deals ({DEAL_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(deal.id.as_uuid())
        .bind(deal.status.as_str())
        .bind(deal.business_id.as_uuid())
        .bind(deal.founder_id.as_uuid())
        .bind(deal.helper_id.as_uuid())
        .bind(deal.post_id.map(|id| id.as_uuid()))
        .bind(deal.created_at)
        .bind(deal.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        insert_milestone_in(&mut tx, &initial).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn insert_milestone(&self, milestone: Milestone) -> EquityResult<()> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT status FROM deals WHERE id = $1 FOR UPDATE")
            .bind(milestone.deal_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Err(EquityError::NotFound(format!(
                "deal {} not found",
                milestone.deal_id
            )));
        };
        let status: String = column(&row, "status")?;
        if DealStatus::parse(&status)? != DealStatus::Active {
            return Err(EquityError::Conflict(format!(
                "deal {} is completed; milestones can no longer be added",
                milestone.deal_id
            )));
        }

        insert_milestone_in(&mut tx, &milestone).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn deal(&self, deal_id: DealId) -> EquityResult<Option<DealView>> {
        let row = sqlx::query(&format!("SELECT {DEAL_COLUMNS} FROM deals WHERE id = $1"))
            .bind(deal_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let deal = deal_from_row(&row)?;

        let rows = sqlx::query(&format!(
            "SELECT {MILESTONE_COLUMNS} FROM deal_milestones WHERE deal_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(deal_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let milestones = rows
            .iter()
            .map(milestone_from_row)
            .collect::<EquityResult<Vec<_>>>()?;

        Ok(Some(DealView { deal, milestones }))
    }

    async fn milestone_with_deal(
        &self,
        milestone_id: MilestoneId,
    ) -> EquityResult<Option<MilestoneWithDeal>> {
        let row = sqlx::query(&format!(
            "SELECT {MILESTONE_COLUMNS} FROM deal_milestones WHERE id = $1"
        ))
        .bind(milestone_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let milestone = milestone_from_row(&row)?;

        let row = sqlx::query(&format!("SELECT {DEAL_COLUMNS} FROM deals WHERE id = $1"))
            .bind(milestone.deal_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref()
            .map(deal_from_row)
            .transpose()
            .map(|deal| deal.map(|deal| MilestoneWithDeal { milestone, deal }))
    }
}

#[async_trait]
impl ApprovalStore for PostgresEquityStore {
    async fn commit_approval(
        &self,
        milestone_id: MilestoneId,
        grant: NewLedgerEntry,
    ) -> EquityResult<LedgerEntry> {
        let entry = grant.seal();
        let mut tx = self.begin().await?;

        // Serializes against settings writes, which lock the same row FOR UPDATE.
        sqlx::query("SELECT 1 FROM businesses WHERE id = $1 FOR SHARE")
            .bind(entry.business_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;

        let flipped = sqlx::query(
            r#"
            UPDATE deal_milestones
               SET status = 'approved',
                   approved_at = $2
             WHERE id = $1
               AND status = 'pending'
            RETURNING deal_id, equity_grant_units
            "#,
        )
        .bind(milestone_id.as_uuid())
        .bind(entry.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let Some(row) = flipped else {
            let exists = sqlx::query("SELECT 1 FROM deal_milestones WHERE id = $1")
                .bind(milestone_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
            return Err(match exists {
                Some(_) => EquityError::already_approved(milestone_id),
                None => EquityError::NotFound(format!("milestone {} not found", milestone_id)),
            });
        };

        let deal_id: Uuid = column(&row, "deal_id")?;
        let units = from_db_units(column(&row, "equity_grant_units")?)?;
        if entry.milestone_id != milestone_id
            || entry.deal_id.as_uuid() != deal_id
            || entry.units != units
        {
            // Dropping the transaction rolls the status flip back.
            return Err(EquityError::InvalidInput(format!(
                "grant does not match milestone {}",
                milestone_id
            )));
        }

        insert_entry_in(&mut tx, &entry).await?;
        tx.commit().await.map_err(backend)?;
        Ok(entry)
    }

    async fn complete_deal_if_settled(&self, deal_id: DealId) -> EquityResult<DealCompletion> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT status FROM deals WHERE id = $1 FOR UPDATE")
            .bind(deal_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Err(EquityError::NotFound(format!("deal {} not found", deal_id)));
        };
        let status: String = column(&row, "status")?;
        if DealStatus::parse(&status)? == DealStatus::Completed {
            return Ok(DealCompletion::AlreadyCompleted);
        }

        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deal_milestones WHERE deal_id = $1 AND status <> 'approved'",
        )
        .bind(deal_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        if open > 0 {
            return Ok(DealCompletion::MilestonesOpen {
                open: usize::try_from(open).unwrap_or(usize::MAX),
            });
        }

        sqlx::query(
            "UPDATE deals SET status = 'completed', completed_at = $2 WHERE id = $1 AND status = 'active'",
        )
        .bind(deal_id.as_uuid())
        .bind(now_micros())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(DealCompletion::Completed)
    }

    async fn close_post(&self, post_id: PostId) -> EquityResult<bool> {
        let result = sqlx::query(
            "UPDATE problem_posts SET status = 'closed' WHERE id = $1 AND status <> 'closed'",
        )
        .bind(post_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM problem_posts WHERE id = $1")
            .bind(post_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(EquityError::NotFound(format!("post {} not found", post_id))),
        }
    }
}

impl EquityStore for PostgresEquityStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }
}

fn backend(err: sqlx::Error) -> EquityError {
    EquityError::storage(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> EquityError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return EquityError::Conflict(db_err.message().to_string());
        }
        if db_err.code().as_deref() == Some("23503") {
            return EquityError::NotFound(db_err.message().to_string());
        }
    }
    EquityError::storage(err.to_string())
}

fn to_db_units(units: u64) -> EquityResult<i64> {
    i64::try_from(units)
        .map_err(|_| EquityError::InvalidInput(format!("unit count {units} exceeds BIGINT range")))
}

fn from_db_units(units: i64) -> EquityResult<u64> {
    u64::try_from(units)
        .map_err(|_| EquityError::storage(format!("negative unit count {units} in storage")))
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> EquityResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| EquityError::storage(format!("postgres decode {name} failed: {e}")))
}

fn business_from_row(row: &PgRow) -> EquityResult<Business> {
    Ok(Business {
        id: BusinessId::from_uuid(column(row, "id")?)?,
        name: column(row, "name")?,
        owner_id: UserId::from_uuid(column(row, "owner_id")?)?,
        created_at: column(row, "created_at")?,
    })
}

fn setting_from_row(row: &PgRow) -> EquityResult<EquitySetting> {
    Ok(EquitySetting {
        business_id: BusinessId::from_uuid(column(row, "business_id")?)?,
        total_units: from_db_units(column(row, "total_units")?)?,
        updated_at: column(row, "updated_at")?,
    })
}

fn post_from_row(row: &PgRow) -> EquityResult<ProblemPost> {
    let status: String = column(row, "status")?;
    Ok(ProblemPost {
        id: PostId::from_uuid(column(row, "id")?)?,
        business_id: BusinessId::from_uuid(column(row, "business_id")?)?,
        title: column(row, "title")?,
        status: PostStatus::parse(&status)?,
        created_at: column(row, "created_at")?,
    })
}

fn proposal_from_row(row: &PgRow) -> EquityResult<Proposal> {
    let status: String = column(row, "status")?;
    let timeline_days: Option<i32> = column(row, "timeline_days")?;
    let equity_ask: Option<i64> = column(row, "equity_ask")?;
    Ok(Proposal {
        id: ProposalId::from_uuid(column(row, "id")?)?,
        post_id: PostId::from_uuid(column(row, "post_id")?)?,
        proposed_by: UserId::from_uuid(column(row, "proposed_by")?)?,
        deliverables: column(row, "deliverables")?,
        timeline_days: timeline_days
            .map(u32::try_from)
            .transpose()
            .map_err(|_| EquityError::storage("negative timeline_days in storage"))?,
        equity_ask: equity_ask.map(from_db_units).transpose()?,
        status: ProposalStatus::parse(&status)?,
        created_at: column(row, "created_at")?,
    })
}

fn deal_from_row(row: &PgRow) -> EquityResult<Deal> {
    let status: String = column(row, "status")?;
    let post_id: Option<Uuid> = column(row, "post_id")?;
    Ok(Deal {
        id: DealId::from_uuid(column(row, "id")?)?,
        status: DealStatus::parse(&status)?,
        business_id: BusinessId::from_uuid(column(row, "business_id")?)?,
        founder_id: UserId::from_uuid(column(row, "founder_id")?)?,
        helper_id: UserId::from_uuid(column(row, "helper_id")?)?,
        post_id: post_id.map(PostId::from_uuid).transpose()?,
        created_at: column(row, "created_at")?,
        completed_at: column(row, "completed_at")?,
    })
}

fn milestone_from_row(row: &PgRow) -> EquityResult<Milestone> {
    let status: String = column(row, "status")?;
    Ok(Milestone {
        id: MilestoneId::from_uuid(column(row, "id")?)?,
        deal_id: DealId::from_uuid(column(row, "deal_id")?)?,
        title: column(row, "title")?,
        acceptance_criteria: column(row, "acceptance_criteria")?,
        equity_grant_units: from_db_units(column(row, "equity_grant_units")?)?,
        status: MilestoneStatus::parse(&status)?,
        created_at: column(row, "created_at")?,
        approved_at: column(row, "approved_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> EquityResult<LedgerEntry> {
    Ok(LedgerEntry {
        id: EntryId::from_uuid(column(row, "id")?)?,
        business_id: BusinessId::from_uuid(column(row, "business_id")?)?,
        recipient_user_id: UserId::from_uuid(column(row, "recipient_user_id")?)?,
        deal_id: DealId::from_uuid(column(row, "deal_id")?)?,
        milestone_id: MilestoneId::from_uuid(column(row, "milestone_id")?)?,
        units: from_db_units(column(row, "units")?)?,
        memo: column(row, "memo")?,
        created_at: column(row, "created_at")?,
        digest: column(row, "digest")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversion_guards_bigint_range() {
        assert_eq!(to_db_units(42).unwrap(), 42);
        assert!(to_db_units(u64::MAX).is_err());
        assert_eq!(from_db_units(7).unwrap(), 7);
        assert!(matches!(
            from_db_units(-1),
            Err(EquityError::StorageFailure(_))
        ));
    }
}
