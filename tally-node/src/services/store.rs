//! Per-node local stores.
//!
//! Each node owns a private SQLite database under
//! `data_dir/nodes/<uid>/node.db`. Coordinators keep their received
//! shares and an append-only computation log; participants keep the
//! values they contributed and the same log shape. On orderly shutdown
//! the whole node directory is purged.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use eyre::Context as _;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use tally_types::{ComputationId, NodeUid};
use tracing::instrument;

/// Opens a SQLite pool at `path` with the pragmas every tally database
/// uses: WAL journal for concurrent readers and a generous busy timeout
/// so contended writers block instead of erroring.
pub(crate) async fn open_node_pool(path: &Path, max_connections: u32) -> eyre::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("while creating database directory")?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(60));
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .context("while connecting to sqlite database")
}

async fn create_log_table(pool: &SqlitePool) -> eyre::Result<()> {
    sqlx::query(
        r#"
            CREATE TABLE IF NOT EXISTS computation_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                comp_id TEXT NOT NULL,
                action TEXT NOT NULL,
                details TEXT,
                logged_at TEXT NOT NULL
            )
        "#,
    )
    .execute(pool)
    .await
    .context("while creating computation_log table")?;
    Ok(())
}

async fn append_log(
    pool: &SqlitePool,
    comp_id: ComputationId,
    action: &str,
    details: &str,
) -> eyre::Result<()> {
    sqlx::query(
        "INSERT INTO computation_log (comp_id, action, details, logged_at) VALUES (?, ?, ?, ?)",
    )
    .bind(comp_id.to_string())
    .bind(action)
    .bind(details)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("while appending to computation log")?;
    Ok(())
}

async fn purge(pool: SqlitePool, dir: PathBuf) -> eyre::Result<()> {
    pool.close().await;
    tokio::fs::remove_dir_all(&dir)
        .await
        .with_context(|| format!("while purging node directory {}", dir.display()))
}

/// A share row in a coordinator's local store.
#[derive(Debug, sqlx::FromRow)]
pub struct StoredShare {
    /// The contributing participant.
    #[sqlx(try_from = "String")]
    pub sender_uid: NodeUid,
    /// The share value, a ring element.
    #[sqlx(try_from = "i64")]
    pub share_value: u32,
    /// When the share was (last) stored.
    pub received_at: DateTime<Utc>,
}

/// Local store of a coordinator node.
#[derive(Clone)]
pub struct CoordinatorStore {
    pool: SqlitePool,
    dir: PathBuf,
}

impl CoordinatorStore {
    /// Opens the store under `data_dir/nodes/<uid>/` and creates its
    /// tables.
    #[instrument(level = "debug", skip(data_dir))]
    pub async fn open(data_dir: &Path, uid: NodeUid) -> eyre::Result<Self> {
        let dir = data_dir.join("nodes").join(uid.to_string());
        let pool = open_node_pool(&dir.join("node.db"), 2).await?;
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS received_shares (
                    comp_id TEXT NOT NULL,
                    sender_uid TEXT NOT NULL,
                    share_value INTEGER NOT NULL,
                    received_at TEXT NOT NULL,
                    PRIMARY KEY (comp_id, sender_uid)
                )
            "#,
        )
        .execute(&pool)
        .await
        .context("while creating received_shares table")?;
        create_log_table(&pool).await?;
        Ok(Self { pool, dir })
    }

    /// Stores a share, replacing any earlier share from the same sender.
    pub async fn upsert_share(
        &self,
        comp_id: ComputationId,
        sender_uid: NodeUid,
        share_value: u32,
    ) -> eyre::Result<()> {
        sqlx::query(
            r#"
                INSERT INTO received_shares (comp_id, sender_uid, share_value, received_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (comp_id, sender_uid)
                DO UPDATE SET share_value = excluded.share_value, received_at = excluded.received_at
            "#,
        )
        .bind(comp_id.to_string())
        .bind(sender_uid.to_string())
        .bind(i64::from(share_value))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("while upserting share")?;
        Ok(())
    }

    /// Lists the stored shares of one computation.
    pub async fn list_shares(&self, comp_id: ComputationId) -> eyre::Result<Vec<StoredShare>> {
        sqlx::query_as("SELECT sender_uid, share_value, received_at FROM received_shares WHERE comp_id = ?")
            .bind(comp_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("while listing shares")
    }

    /// Appends an action to the computation log.
    pub async fn append_log(
        &self,
        comp_id: ComputationId,
        action: &str,
        details: &str,
    ) -> eyre::Result<()> {
        append_log(&self.pool, comp_id, action, details).await
    }

    /// Closes the pool and deletes the node directory.
    pub async fn purge(self) -> eyre::Result<()> {
        purge(self.pool, self.dir).await
    }
}

/// Local store of a participant node.
#[derive(Clone)]
pub struct ParticipantStore {
    pool: SqlitePool,
    dir: PathBuf,
}

impl ParticipantStore {
    /// Opens the store under `data_dir/nodes/<uid>/` and creates its
    /// tables.
    #[instrument(level = "debug", skip(data_dir))]
    pub async fn open(data_dir: &Path, uid: NodeUid) -> eyre::Result<Self> {
        let dir = data_dir.join("nodes").join(uid.to_string());
        let pool = open_node_pool(&dir.join("node.db"), 2).await?;
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS computation_responses (
                    comp_id TEXT PRIMARY KEY,
                    response_value INTEGER NOT NULL,
                    responded_at TEXT NOT NULL
                )
            "#,
        )
        .execute(&pool)
        .await
        .context("while creating computation_responses table")?;
        create_log_table(&pool).await?;
        Ok(Self { pool, dir })
    }

    /// Records the value this node contributed to a computation.
    pub async fn upsert_response(&self, comp_id: ComputationId, value: u32) -> eyre::Result<()> {
        sqlx::query(
            r#"
                INSERT INTO computation_responses (comp_id, response_value, responded_at)
                VALUES (?, ?, ?)
                ON CONFLICT (comp_id)
                DO UPDATE SET response_value = excluded.response_value, responded_at = excluded.responded_at
            "#,
        )
        .bind(comp_id.to_string())
        .bind(i64::from(value))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("while upserting response")?;
        Ok(())
    }

    /// Returns the recorded contribution for a computation, if any.
    pub async fn get_response(&self, comp_id: ComputationId) -> eyre::Result<Option<u32>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT response_value FROM computation_responses WHERE comp_id = ?")
                .bind(comp_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("while fetching response")?;
        Ok(row.map(|(v,)| v as u32))
    }

    /// Appends an action to the computation log.
    pub async fn append_log(
        &self,
        comp_id: ComputationId,
        action: &str,
        details: &str,
    ) -> eyre::Result<()> {
        append_log(&self.pool, comp_id, action, details).await
    }

    /// Closes the pool and deletes the node directory.
    pub async fn purge(self) -> eyre::Result<()> {
        purge(self.pool, self.dir).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn share_upsert_is_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let uid = NodeUid::generate();
        let store = CoordinatorStore::open(dir.path(), uid).await.unwrap();
        let comp_id = ComputationId::generate();
        let sender = NodeUid::generate();

        store.upsert_share(comp_id, sender, 10).await.unwrap();
        store.upsert_share(comp_id, sender, 20).await.unwrap();
        store.upsert_share(comp_id, NodeUid::generate(), 30).await.unwrap();

        let shares = store.list_shares(comp_id).await.unwrap();
        assert_eq!(shares.len(), 2);
        let replaced = shares.iter().find(|s| s.sender_uid == sender).unwrap();
        assert_eq!(replaced.share_value, 20);
        assert!(store.list_shares(ComputationId::generate()).await.unwrap().is_empty());

        store.append_log(comp_id, "finalized", "2 shares").await.unwrap();
        store.purge().await.unwrap();
        assert!(!dir.path().join("nodes").join(uid.to_string()).exists());
    }

    #[tokio::test]
    async fn participant_response_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = ParticipantStore::open(dir.path(), NodeUid::generate())
            .await
            .unwrap();
        let comp_id = ComputationId::generate();

        store.upsert_response(comp_id, 77).await.unwrap();
        assert_eq!(store.get_response(comp_id).await.unwrap(), Some(77));
        assert_eq!(
            store.get_response(ComputationId::generate()).await.unwrap(),
            None
        );
        store.append_log(comp_id, "responded", "value recorded").await.unwrap();
    }
}
