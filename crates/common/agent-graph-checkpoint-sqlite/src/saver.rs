//! SQLite checkpoint backend.
//!
//! Every write runs in one transaction that first touches the thread row, so
//! the database write lock is taken before anything is read. Reads that need
//! a consistent view (snapshots) run inside a single read transaction.

use agent_graph_checkpoint::{
    Branch, Checkpoint, CheckpointBackend, CheckpointError, NewBranch, NewCheckpoint,
    ROOT_BRANCH_NAME, Result, ThreadSnapshot, ThreadSummary, default_branch_name, new_id,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqliteConnection, Transaction};
use tracing::{debug, info};

use crate::config::SqliteConfig;
use crate::error::{SqliteError, SqlxResultExt};

macro_rules! select_checkpoints {
    ($tail:literal) => {
        concat!(
            "SELECT thread_id, namespace, checkpoint_id, parent_checkpoint_id, step, source, ",
            "payload, metadata, created_at FROM checkpoints ",
            $tail
        )
    };
}

macro_rules! select_branches {
    ($tail:literal) => {
        concat!(
            "SELECT branch_id, thread_id, namespace, name, fork_point_id, head_checkpoint_id, ",
            "is_active, created_at FROM branches ",
            $tail
        )
    };
}

/// Durable checkpoint backend over a pooled SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteSaver {
    pool: SqlitePool,
}

impl SqliteSaver {
    /// Open (creating if needed) the database and apply pending migrations.
    pub async fn connect(config: &SqliteConfig) -> std::result::Result<Self, SqliteError> {
        debug!(
            "Opening checkpoint database at {}",
            config.database_path.display()
        );

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        info!("Checkpoint database ready");

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        let migrator = sqlx::migrate!("src/migrations");
        migrator.run(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Truncated to what the text encoding keeps, so written and re-read
/// checkpoints compare equal.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CheckpointError::invalid_state(format!("corrupt timestamp '{raw}': {e}")))
}

#[derive(FromRow)]
struct CheckpointRow {
    thread_id: String,
    namespace: String,
    checkpoint_id: String,
    parent_checkpoint_id: Option<String>,
    step: i64,
    source: String,
    payload: String,
    metadata: String,
    created_at: String,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = CheckpointError;

    fn try_from(row: CheckpointRow) -> Result<Self> {
        Ok(Checkpoint {
            source: row.source.parse()?,
            payload: serde_json::from_str(&row.payload)?,
            metadata: serde_json::from_str(&row.metadata)?,
            created_at: decode_ts(&row.created_at)?,
            thread_id: row.thread_id,
            namespace: row.namespace,
            checkpoint_id: row.checkpoint_id,
            parent_checkpoint_id: row.parent_checkpoint_id,
            step: row.step,
        })
    }
}

#[derive(FromRow)]
struct BranchRow {
    branch_id: String,
    thread_id: String,
    namespace: String,
    name: String,
    fork_point_id: Option<String>,
    head_checkpoint_id: String,
    is_active: bool,
    created_at: String,
}

impl TryFrom<BranchRow> for Branch {
    type Error = CheckpointError;

    fn try_from(row: BranchRow) -> Result<Self> {
        Ok(Branch {
            created_at: decode_ts(&row.created_at)?,
            branch_id: row.branch_id,
            thread_id: row.thread_id,
            namespace: row.namespace,
            name: row.name,
            fork_point_id: row.fork_point_id,
            head_checkpoint_id: row.head_checkpoint_id,
            is_active: row.is_active,
        })
    }
}

#[derive(FromRow)]
struct SummaryRow {
    thread_id: String,
    created_at: String,
    last_activity: String,
    checkpoint_count: i64,
}

impl TryFrom<SummaryRow> for ThreadSummary {
    type Error = CheckpointError;

    fn try_from(row: SummaryRow) -> Result<Self> {
        Ok(ThreadSummary {
            created_at: decode_ts(&row.created_at)?,
            last_activity: Some(decode_ts(&row.last_activity)?),
            checkpoint_count: u64::try_from(row.checkpoint_count).unwrap_or_default(),
            thread_id: row.thread_id,
        })
    }
}

async fn fetch_checkpoint(
    conn: &mut SqliteConnection,
    operation: &'static str,
    thread_id: &str,
    checkpoint_id: &str,
) -> Result<Option<Checkpoint>> {
    sqlx::query_as::<_, CheckpointRow>(select_checkpoints!(
        "WHERE thread_id = ?1 AND checkpoint_id = ?2"
    ))
    .bind(thread_id)
    .bind(checkpoint_id)
    .fetch_optional(conn)
    .await
    .during(operation, thread_id)?
    .map(Checkpoint::try_from)
    .transpose()
}

async fn fetch_active_branch(
    conn: &mut SqliteConnection,
    operation: &'static str,
    thread_id: &str,
    namespace: &str,
) -> Result<Option<Branch>> {
    sqlx::query_as::<_, BranchRow>(select_branches!(
        "WHERE thread_id = ?1 AND namespace = ?2 AND is_active = 1"
    ))
    .bind(thread_id)
    .bind(namespace)
    .fetch_optional(conn)
    .await
    .during(operation, thread_id)?
    .map(Branch::try_from)
    .transpose()
}

async fn fetch_branch(
    conn: &mut SqliteConnection,
    operation: &'static str,
    thread_id: &str,
    branch_id: &str,
) -> Result<Option<Branch>> {
    sqlx::query_as::<_, BranchRow>(select_branches!("WHERE branch_id = ?1"))
        .bind(branch_id)
        .fetch_optional(conn)
        .await
        .during(operation, thread_id)?
        .map(Branch::try_from)
        .transpose()
}

async fn fetch_branches(
    conn: &mut SqliteConnection,
    operation: &'static str,
    thread_id: &str,
    namespace: &str,
) -> Result<Vec<Branch>> {
    sqlx::query_as::<_, BranchRow>(select_branches!(
        "WHERE thread_id = ?1 AND namespace = ?2 ORDER BY seq"
    ))
    .bind(thread_id)
    .bind(namespace)
    .fetch_all(conn)
    .await
    .during(operation, thread_id)?
    .into_iter()
    .map(Branch::try_from)
    .collect()
}

async fn fetch_snapshot(
    conn: &mut SqliteConnection,
    operation: &'static str,
    thread_id: &str,
    namespace: &str,
) -> Result<ThreadSnapshot> {
    let rows = sqlx::query_as::<_, CheckpointRow>(select_checkpoints!(
        "WHERE thread_id = ?1 AND namespace = ?2 ORDER BY seq"
    ))
    .bind(thread_id)
    .bind(namespace)
    .fetch_all(&mut *conn)
    .await
    .during(operation, thread_id)?;

    let mut snapshot = ThreadSnapshot::default();
    for row in rows {
        let checkpoint = Checkpoint::try_from(row)?;
        snapshot
            .checkpoints
            .insert(checkpoint.checkpoint_id.clone(), checkpoint);
    }
    snapshot.branches = fetch_branches(conn, operation, thread_id, namespace).await?;
    Ok(snapshot)
}

/// One write transaction scoped to a `(thread_id, namespace)` chain.
///
/// Dropped without [`WriteTxn::commit`], sqlx rolls every sub-write back.
pub(crate) struct WriteTxn {
    tx: Transaction<'static, Sqlite>,
    operation: &'static str,
    thread_id: String,
    namespace: String,
}

impl WriteTxn {
    pub(crate) async fn begin(
        pool: &SqlitePool,
        operation: &'static str,
        thread_id: &str,
        namespace: &str,
    ) -> Result<Self> {
        let mut tx = pool.begin().await.during(operation, thread_id)?;

        // Writing first takes the database write lock up front; a read first
        // would risk an unrecoverable lock upgrade.
        let touched_at = encode_ts(&now());
        sqlx::query(
            r#"
            INSERT INTO threads (thread_id, created_at, updated_at)
            VALUES (?1, ?2, ?2)
            ON CONFLICT (thread_id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(thread_id)
        .bind(&touched_at)
        .execute(&mut *tx)
        .await
        .during(operation, thread_id)?;

        Ok(Self {
            tx,
            operation,
            thread_id: thread_id.to_string(),
            namespace: namespace.to_string(),
        })
    }

    /// Resolve a checkpoint that must live in this chain.
    async fn resolve_in_chain(&mut self, checkpoint_id: &str) -> Result<Checkpoint> {
        match fetch_checkpoint(&mut self.tx, self.operation, &self.thread_id, checkpoint_id).await? {
            Some(checkpoint) if checkpoint.namespace == self.namespace => Ok(checkpoint),
            Some(other) => Err(CheckpointError::invalid_state(format!(
                "checkpoint {checkpoint_id} belongs to namespace '{}', not '{}'",
                other.namespace, self.namespace
            ))),
            None => Err(CheckpointError::not_found_with_id("checkpoint", checkpoint_id)),
        }
    }

    async fn active_branch(&mut self) -> Result<Option<Branch>> {
        fetch_active_branch(&mut self.tx, self.operation, &self.thread_id, &self.namespace).await
    }

    /// Whether `ancestor` lies on the parent chain of `descendant`, walked in
    /// SQL so no payload is loaded.
    async fn is_ancestor(&mut self, ancestor: &str, descendant: &str) -> Result<bool> {
        let found: i64 = sqlx::query_scalar(
            r#"
            WITH RECURSIVE lineage (checkpoint_id, parent_checkpoint_id) AS (
                SELECT checkpoint_id, parent_checkpoint_id
                FROM checkpoints
                WHERE thread_id = ?1 AND namespace = ?2 AND checkpoint_id = ?3
                UNION
                SELECT c.checkpoint_id, c.parent_checkpoint_id
                FROM checkpoints c
                JOIN lineage l ON c.checkpoint_id = l.parent_checkpoint_id
                WHERE c.thread_id = ?1 AND c.namespace = ?2
            )
            SELECT EXISTS (SELECT 1 FROM lineage WHERE checkpoint_id = ?4)
            "#,
        )
        .bind(&self.thread_id)
        .bind(&self.namespace)
        .bind(descendant)
        .bind(ancestor)
        .fetch_one(&mut *self.tx)
        .await
        .during(self.operation, &self.thread_id)?;

        Ok(found != 0)
    }

    async fn insert_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let payload = serde_json::to_string(&checkpoint.payload)?;
        let metadata = serde_json::to_string(&checkpoint.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                thread_id, namespace, checkpoint_id, parent_checkpoint_id, step, source,
                payload, metadata, created_at, seq
            )
            VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE thread_id = ?1)
            )
            "#,
        )
        .bind(&checkpoint.thread_id)
        .bind(&checkpoint.namespace)
        .bind(&checkpoint.checkpoint_id)
        .bind(&checkpoint.parent_checkpoint_id)
        .bind(checkpoint.step)
        .bind(checkpoint.source.as_str())
        .bind(payload)
        .bind(metadata)
        .bind(encode_ts(&checkpoint.created_at))
        .execute(&mut *self.tx)
        .await
        .during(self.operation, &self.thread_id)?;

        Ok(())
    }

    async fn insert_branch(&mut self, branch: &Branch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO branches (
                branch_id, thread_id, namespace, name, fork_point_id, head_checkpoint_id,
                is_active, created_at, seq
            )
            VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM branches WHERE thread_id = ?2)
            )
            "#,
        )
        .bind(&branch.branch_id)
        .bind(&branch.thread_id)
        .bind(&branch.namespace)
        .bind(&branch.name)
        .bind(&branch.fork_point_id)
        .bind(&branch.head_checkpoint_id)
        .bind(branch.is_active)
        .bind(encode_ts(&branch.created_at))
        .execute(&mut *self.tx)
        .await
        .during(self.operation, &self.thread_id)?;

        Ok(())
    }

    async fn set_active(&mut self, branch_id: &str) -> Result<()> {
        self.branch(branch_id).await?;

        // Two statements: the one-active index is checked row by row.
        sqlx::query(
            "UPDATE branches SET is_active = 0 WHERE thread_id = ?1 AND namespace = ?2 AND is_active = 1",
        )
        .bind(&self.thread_id)
        .bind(&self.namespace)
        .execute(&mut *self.tx)
        .await
        .during(self.operation, &self.thread_id)?;

        sqlx::query("UPDATE branches SET is_active = 1 WHERE branch_id = ?1")
            .bind(branch_id)
            .execute(&mut *self.tx)
            .await
            .during(self.operation, &self.thread_id)?;

        Ok(())
    }

    async fn set_head(&mut self, branch_id: &str, checkpoint_id: &str) -> Result<()> {
        self.resolve_in_chain(checkpoint_id).await?;

        let updated = sqlx::query(
            r#"
            UPDATE branches SET head_checkpoint_id = ?1
            WHERE branch_id = ?2 AND thread_id = ?3 AND namespace = ?4
            "#,
        )
        .bind(checkpoint_id)
        .bind(branch_id)
        .bind(&self.thread_id)
        .bind(&self.namespace)
        .execute(&mut *self.tx)
        .await
        .during(self.operation, &self.thread_id)?;

        if updated.rows_affected() == 0 {
            return Err(CheckpointError::not_found_with_id("branch", branch_id));
        }
        Ok(())
    }

    /// A branch of this chain, as currently staged.
    async fn branch(&mut self, branch_id: &str) -> Result<Branch> {
        fetch_branch(&mut self.tx, self.operation, &self.thread_id, branch_id)
            .await?
            .filter(|b| b.belongs_to(&self.thread_id, &self.namespace))
            .ok_or_else(|| CheckpointError::not_found_with_id("branch", branch_id))
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.during(self.operation, &self.thread_id)
    }
}

#[async_trait]
impl CheckpointBackend for SqliteSaver {
    async fn append(&self, new: NewCheckpoint) -> Result<Checkpoint> {
        let mut txn = WriteTxn::begin(&self.pool, "append", &new.thread_id, &new.namespace).await?;

        let active = txn.active_branch().await?;
        let active_head = active.as_ref().map(|b| b.head_checkpoint_id.as_str());

        match &new.parent_checkpoint_id {
            Some(parent_id) => {
                let parent = txn.resolve_in_chain(parent_id).await?;
                if new.step <= parent.step {
                    return Err(CheckpointError::invalid_state(format!(
                        "step {} does not follow parent step {}",
                        new.step, parent.step
                    )));
                }
                if active_head != Some(parent_id.as_str()) {
                    return Err(CheckpointError::conflict(
                        "append",
                        &new.thread_id,
                        format!(
                            "expected head {parent_id}, active head is {}",
                            active_head.unwrap_or("<none>")
                        ),
                    ));
                }
            }
            None => {
                if let Some(head) = active_head {
                    return Err(CheckpointError::conflict(
                        "append",
                        &new.thread_id,
                        format!("chain already started, active head is {head}"),
                    ));
                }
                if new.step < 0 {
                    return Err(CheckpointError::invalid_state(format!(
                        "first step must be non-negative, got {}",
                        new.step
                    )));
                }
            }
        }

        let checkpoint = Checkpoint {
            thread_id: new.thread_id,
            namespace: new.namespace,
            checkpoint_id: new_id(),
            parent_checkpoint_id: new.parent_checkpoint_id,
            step: new.step,
            source: new.source,
            payload: new.payload,
            metadata: new.metadata,
            created_at: now(),
        };

        txn.insert_checkpoint(&checkpoint).await?;
        match active {
            Some(branch) => {
                txn.set_head(&branch.branch_id, &checkpoint.checkpoint_id)
                    .await?
            }
            None => {
                txn.insert_branch(&Branch {
                    branch_id: new_id(),
                    thread_id: checkpoint.thread_id.clone(),
                    namespace: checkpoint.namespace.clone(),
                    name: ROOT_BRANCH_NAME.to_string(),
                    fork_point_id: None,
                    head_checkpoint_id: checkpoint.checkpoint_id.clone(),
                    is_active: true,
                    created_at: checkpoint.created_at,
                })
                .await?
            }
        }
        txn.commit().await?;

        Ok(checkpoint)
    }

    async fn find_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>> {
        let mut conn = self.pool.acquire().await.during("get", thread_id)?;
        fetch_checkpoint(&mut conn, "get", thread_id, checkpoint_id).await
    }

    async fn active_branch(&self, thread_id: &str, namespace: &str) -> Result<Option<Branch>> {
        let mut conn = self.pool.acquire().await.during("active_branch", thread_id)?;
        fetch_active_branch(&mut conn, "active_branch", thread_id, namespace).await
    }

    async fn list_branches(&self, thread_id: &str, namespace: &str) -> Result<Vec<Branch>> {
        let mut conn = self.pool.acquire().await.during("list_branches", thread_id)?;
        fetch_branches(&mut conn, "list_branches", thread_id, namespace).await
    }

    async fn create_branch(&self, new: NewBranch, activate: bool) -> Result<Branch> {
        let operation = if activate { "time_travel" } else { "fork" };
        let mut txn = WriteTxn::begin(&self.pool, operation, &new.thread_id, &new.namespace).await?;
        txn.resolve_in_chain(&new.source_checkpoint_id).await?;

        let branch_id = new_id();
        let name = new
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_branch_name(&branch_id));

        txn.insert_branch(&Branch {
            branch_id: branch_id.clone(),
            thread_id: new.thread_id.clone(),
            namespace: new.namespace.clone(),
            name,
            fork_point_id: Some(new.source_checkpoint_id.clone()),
            head_checkpoint_id: new.source_checkpoint_id.clone(),
            is_active: false,
            created_at: now(),
        })
        .await?;
        if activate {
            txn.set_active(&branch_id).await?;
            txn.set_head(&branch_id, &new.source_checkpoint_id).await?;
        }
        let branch = txn.branch(&branch_id).await?;
        txn.commit().await?;

        Ok(branch)
    }

    async fn activate_branch(
        &self,
        thread_id: &str,
        namespace: &str,
        branch_id: &str,
    ) -> Result<Branch> {
        let mut txn = WriteTxn::begin(&self.pool, "switch_active", thread_id, namespace).await?;

        let owner = fetch_branch(&mut txn.tx, "switch_active", thread_id, branch_id)
            .await?
            .ok_or_else(|| CheckpointError::not_found_with_id("branch", branch_id))?;
        if !owner.belongs_to(thread_id, namespace) {
            return Err(CheckpointError::invalid_state(format!(
                "branch {branch_id} does not belong to thread {thread_id} namespace '{namespace}'"
            )));
        }

        txn.set_active(branch_id).await?;
        let branch = txn.branch(branch_id).await?;
        txn.commit().await?;

        Ok(branch)
    }

    async fn advance_head(
        &self,
        thread_id: &str,
        namespace: &str,
        checkpoint_id: &str,
    ) -> Result<Branch> {
        let mut txn = WriteTxn::begin(&self.pool, "advance_active", thread_id, namespace).await?;
        txn.resolve_in_chain(checkpoint_id).await?;

        let active = txn
            .active_branch()
            .await?
            .ok_or_else(|| CheckpointError::invalid_state("no active branch to advance"))?;
        if !txn.is_ancestor(&active.head_checkpoint_id, checkpoint_id).await? {
            return Err(CheckpointError::invalid_state(format!(
                "checkpoint {checkpoint_id} does not descend from head {}",
                active.head_checkpoint_id
            )));
        }

        txn.set_head(&active.branch_id, checkpoint_id).await?;
        let branch = txn.branch(&active.branch_id).await?;
        txn.commit().await?;

        Ok(branch)
    }

    async fn snapshot(&self, thread_id: &str, namespace: &str) -> Result<ThreadSnapshot> {
        let mut tx = self.pool.begin().await.during("snapshot", thread_id)?;
        let snapshot = fetch_snapshot(&mut tx, "snapshot", thread_id, namespace).await?;
        tx.commit().await.during("snapshot", thread_id)?;
        Ok(snapshot)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.during("delete_thread", thread_id)?;
        let deleted = sqlx::query("DELETE FROM threads WHERE thread_id = ?1")
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .during("delete_thread", thread_id)?;
        tx.commit().await.during("delete_thread", thread_id)?;

        Ok(deleted.rows_affected() > 0)
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT thread_id,
                   MIN(created_at) AS created_at,
                   MAX(created_at) AS last_activity,
                   COUNT(*) AS checkpoint_count
            FROM checkpoints
            GROUP BY thread_id
            ORDER BY last_activity DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .during("list_threads", "*")?
        .into_iter()
        .map(ThreadSummary::try_from)
        .collect()
    }

    async fn thread_summary(&self, thread_id: &str) -> Result<Option<ThreadSummary>> {
        sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT thread_id,
                   MIN(created_at) AS created_at,
                   MAX(created_at) AS last_activity,
                   COUNT(*) AS checkpoint_count
            FROM checkpoints
            WHERE thread_id = ?1
            GROUP BY thread_id
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .during("thread_summary", thread_id)?
        .map(ThreadSummary::try_from)
        .transpose()
    }
}
