//! The shared network registry.
//!
//! The registry is the only state shared across nodes: one SQLite
//! database holding the `nodes` and `computations` tables plus the
//! endpoint allocation sequence. Every node of one logical network opens
//! the same file; WAL mode and a busy timeout absorb the concurrent
//! access, and contended writes are additionally retried with
//! exponential backoff at the call site.
//!
//! The computation status column is guarded: terminal transitions only
//! apply to rows still in `pending`, so a completed or failed
//! computation can never change its outcome again.

use std::path::Path;

use backon::{ExponentialBuilder, Retryable as _};
use chrono::Utc;
use eyre::Context as _;
use sqlx::SqlitePool;
use tally_types::{
    ComputationDescriptor, ComputationId, ComputationRecord, ComputationStatus, CoordinatorSet,
    FailureReason, NodeRecord, NodeRole, NodeStatus, NodeUid,
};
use tracing::instrument;

use crate::services::store::open_node_pool;

/// Handle to the shared network registry.
#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
    base_endpoint: u16,
}

#[derive(Debug, sqlx::FromRow)]
struct NodeRow {
    uid: String,
    role: String,
    endpoint: i64,
    status: String,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ComputationRow {
    comp_id: String,
    proposer_uid: String,
    coordinator_1: String,
    coordinator_2: String,
    coordinator_3: String,
    prompt: String,
    response_schema: String,
    deadline: chrono::DateTime<Utc>,
    min_participants: i64,
    status: String,
    result: Option<i64>,
    participants_count: Option<i64>,
    created_at: chrono::DateTime<Utc>,
    completed_at: Option<chrono::DateTime<Utc>>,
}

impl From<NodeRow> for NodeRecord {
    fn from(row: NodeRow) -> Self {
        NodeRecord {
            uid: row.uid.parse().expect("registry is sane"),
            role: row.role.parse().expect("registry is sane"),
            endpoint: u16::try_from(row.endpoint).expect("registry is sane"),
            status: row.status.parse().expect("registry is sane"),
            created_at: row.created_at,
        }
    }
}

impl From<ComputationRow> for ComputationRecord {
    fn from(row: ComputationRow) -> Self {
        let parse_uid = |s: &str| -> NodeUid { s.parse().expect("registry is sane") };
        ComputationRecord {
            descriptor: ComputationDescriptor {
                comp_id: row.comp_id.parse().expect("registry is sane"),
                proposer_uid: parse_uid(&row.proposer_uid),
                coordinators: CoordinatorSet::new([
                    parse_uid(&row.coordinator_1),
                    parse_uid(&row.coordinator_2),
                    parse_uid(&row.coordinator_3),
                ]),
                prompt: row.prompt,
                response_schema: row.response_schema,
                deadline: row.deadline,
                min_participants: row.min_participants as u32,
            },
            status: row.status.parse().expect("registry is sane"),
            result: row.result.map(|r| r as u32),
            participants_count: row.participants_count.map(|c| c as u32),
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

/// SQLite reports contention as `database is locked`/`database table is
/// locked`; everything else is not worth retrying.
fn is_contention(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("locked"))
}

impl Registry {
    /// Opens (and if necessary creates) the registry at
    /// `data_dir/network.db`.
    #[instrument(level = "debug", skip_all)]
    pub async fn open(data_dir: &Path, base_endpoint: u16) -> eyre::Result<Self> {
        let pool = open_node_pool(&data_dir.join("network.db"), 4)
            .await
            .context("while opening registry database")?;
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS nodes (
                    uid TEXT PRIMARY KEY,
                    role TEXT NOT NULL CHECK(role IN ('coordinator', 'participant')),
                    endpoint INTEGER NOT NULL UNIQUE,
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL
                )
            "#,
        )
        .execute(&pool)
        .await
        .context("while creating nodes table")?;
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS endpoint_alloc (
                    id INTEGER PRIMARY KEY AUTOINCREMENT
                )
            "#,
        )
        .execute(&pool)
        .await
        .context("while creating endpoint allocation table")?;
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS computations (
                    comp_id TEXT PRIMARY KEY,
                    proposer_uid TEXT NOT NULL,
                    coordinator_1 TEXT NOT NULL,
                    coordinator_2 TEXT NOT NULL,
                    coordinator_3 TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    response_schema TEXT NOT NULL,
                    deadline TEXT NOT NULL,
                    min_participants INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    result INTEGER,
                    participants_count INTEGER,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                )
            "#,
        )
        .execute(&pool)
        .await
        .context("while creating computations table")?;
        Ok(Self {
            pool,
            base_endpoint,
        })
    }

    /// Registers a node under a fresh uid/endpoint pair.
    ///
    /// Returns `false` if the uid or the endpoint is already in use.
    #[instrument(level = "debug", skip(self))]
    pub async fn register_node(
        &self,
        uid: NodeUid,
        role: NodeRole,
        endpoint: u16,
    ) -> eyre::Result<bool> {
        let uid = uid.to_string();
        let insert = || async {
            sqlx::query(
                "INSERT INTO nodes (uid, role, endpoint, status, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&uid)
            .bind(role.as_str())
            .bind(i64::from(endpoint))
            .bind(NodeStatus::Active.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
        };
        let result = insert
            .retry(ExponentialBuilder::default())
            .sleep(tokio::time::sleep)
            .when(is_contention)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::warn!("uid {uid} or endpoint {endpoint} already registered");
                Ok(false)
            }
            Err(err) => Err(err).context("while registering node"),
        }
    }

    /// Removes a node row; returns whether a row existed.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove_node(&self, uid: NodeUid) -> eyre::Result<bool> {
        let uid = uid.to_string();
        let delete = || async {
            sqlx::query("DELETE FROM nodes WHERE uid = ?")
                .bind(&uid)
                .execute(&self.pool)
                .await
        };
        let result = delete
            .retry(ExponentialBuilder::default())
            .sleep(tokio::time::sleep)
            .when(is_contention)
            .await
            .context("while removing node")?;
        Ok(result.rows_affected() > 0)
    }

    /// Looks up a single node by uid.
    pub async fn lookup_node(&self, uid: NodeUid) -> eyre::Result<Option<NodeRecord>> {
        let row: Option<NodeRow> = sqlx::query_as("SELECT * FROM nodes WHERE uid = ?")
            .bind(uid.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("while looking up node")?;
        Ok(row.map(NodeRecord::from))
    }

    /// Lists all registered nodes, oldest first.
    pub async fn list_nodes(&self) -> eyre::Result<Vec<NodeRecord>> {
        let rows: Vec<NodeRow> = sqlx::query_as("SELECT * FROM nodes ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("while listing nodes")?;
        Ok(rows.into_iter().map(NodeRecord::from).collect())
    }

    /// Lists all active nodes with the given role.
    pub async fn list_nodes_by_role(&self, role: NodeRole) -> eyre::Result<Vec<NodeRecord>> {
        let rows: Vec<NodeRow> =
            sqlx::query_as("SELECT * FROM nodes WHERE role = ? AND status = 'active'")
                .bind(role.as_str())
                .fetch_all(&self.pool)
                .await
                .context("while listing nodes by role")?;
        Ok(rows.into_iter().map(NodeRecord::from).collect())
    }

    /// Allocates the next endpoint above the base.
    ///
    /// Allocation burns a row of a monotonic sequence, so concurrent
    /// callers always receive distinct endpoints.
    pub async fn next_available_endpoint(&self) -> eyre::Result<u16> {
        let alloc = || async {
            sqlx::query_as::<_, (i64,)>("INSERT INTO endpoint_alloc DEFAULT VALUES RETURNING id")
                .fetch_one(&self.pool)
                .await
        };
        let (id,) = alloc
            .retry(ExponentialBuilder::default())
            .sleep(tokio::time::sleep)
            .when(is_contention)
            .await
            .context("while allocating endpoint")?;
        u16::try_from(i64::from(self.base_endpoint) + id)
            .map_err(|_| eyre::eyre!("endpoint allocation exhausted the port range"))
    }

    /// Persists a freshly proposed computation descriptor.
    ///
    /// Returns `false` if the computation id is already taken.
    #[instrument(level = "debug", skip_all, fields(comp_id = %descriptor.comp_id))]
    pub async fn add_computation(&self, descriptor: &ComputationDescriptor) -> eyre::Result<bool> {
        let coordinators = descriptor.coordinators.as_array();
        let result = sqlx::query(
            r#"
                INSERT INTO computations (
                    comp_id, proposer_uid, coordinator_1, coordinator_2, coordinator_3,
                    prompt, response_schema, deadline, min_participants, status, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(descriptor.comp_id.to_string())
        .bind(descriptor.proposer_uid.to_string())
        .bind(coordinators[0].to_string())
        .bind(coordinators[1].to_string())
        .bind(coordinators[2].to_string())
        .bind(&descriptor.prompt)
        .bind(&descriptor.response_schema)
        .bind(descriptor.deadline)
        .bind(i64::from(descriptor.min_participants))
        .bind(Utc::now())
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::warn!("computation already exists");
                Ok(false)
            }
            Err(err) => Err(err).context("while adding computation"),
        }
    }

    /// Fetches a computation row by id.
    pub async fn get_computation(
        &self,
        comp_id: ComputationId,
    ) -> eyre::Result<Option<ComputationRecord>> {
        let row: Option<ComputationRow> =
            sqlx::query_as("SELECT * FROM computations WHERE comp_id = ?")
                .bind(comp_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("while fetching computation")?;
        Ok(row.map(ComputationRecord::from))
    }

    /// Marks a computation completed with its reconstructed sum.
    ///
    /// Only applies while the row is still `pending`; returns whether
    /// the transition happened.
    #[instrument(level = "debug", skip(self))]
    pub async fn set_computation_result(
        &self,
        comp_id: ComputationId,
        result: u32,
        participants_count: u32,
    ) -> eyre::Result<bool> {
        let comp_id = comp_id.to_string();
        let update = || async {
            sqlx::query(
                r#"
                    UPDATE computations
                    SET status = ?, result = ?, participants_count = ?, completed_at = ?
                    WHERE comp_id = ? AND status = 'pending'
                "#,
            )
            .bind(ComputationStatus::Completed.to_string())
            .bind(i64::from(result))
            .bind(i64::from(participants_count))
            .bind(Utc::now())
            .bind(&comp_id)
            .execute(&self.pool)
            .await
        };
        let result = update
            .retry(ExponentialBuilder::default())
            .sleep(tokio::time::sleep)
            .when(is_contention)
            .await
            .context("while storing computation result")?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks a computation failed with the given reason.
    ///
    /// Only applies while the row is still `pending`; returns whether
    /// the transition happened.
    #[instrument(level = "debug", skip(self, reason), fields(reason = %reason))]
    pub async fn set_computation_failed(
        &self,
        comp_id: ComputationId,
        reason: &FailureReason,
    ) -> eyre::Result<bool> {
        let comp_id = comp_id.to_string();
        let status = ComputationStatus::Failed(reason.clone()).to_string();
        let update = || async {
            sqlx::query(
                r#"
                    UPDATE computations
                    SET status = ?, completed_at = ?
                    WHERE comp_id = ? AND status = 'pending'
                "#,
            )
            .bind(&status)
            .bind(Utc::now())
            .bind(&comp_id)
            .execute(&self.pool)
            .await
        };
        let result = update
            .retry(ExponentialBuilder::default())
            .sleep(tokio::time::sleep)
            .when(is_contention)
            .await
            .context("while storing computation failure")?;
        Ok(result.rows_affected() > 0)
    }
}
