use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::billing::refund_tokens;
use crate::db::models::{
    FailedTaskClaim, GeneratedImageInsert, GenerationTaskRow, ProgressUpdate, TaskStatus,
};

const PROGRESS_QUEUE_CAPACITY: usize = 1000;

/// Outcome of trying to settle a task as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSettlement {
    /// This call flipped the task to failed and credited the tokens back.
    Refunded { user_id: String, amount: i64 },
    /// This call flipped the task to failed; nothing had been deducted.
    FailedWithoutRefund,
    /// Another poll already settled the task.
    AlreadySettled { refunded: bool },
    /// No generation task row exists for this batch.
    NotTracked,
}

impl FailureSettlement {
    pub fn refunded(&self) -> bool {
        match self {
            Self::Refunded { .. } => true,
            Self::AlreadySettled { refunded } => *refunded,
            Self::FailedWithoutRefund | Self::NotTracked => false,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    sender: mpsc::Sender<ProgressUpdate>,
}

impl Database {
    pub async fn init(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        create_schema(&pool).await?;
        info!("Database tables created successfully");

        let (sender, receiver) = mpsc::channel(PROGRESS_QUEUE_CAPACITY);
        let writer_pool = pool.clone();
        tokio::spawn(async move {
            progress_writer(writer_pool, receiver).await;
        });

        info!("Progress writer task started");

        Ok(Database { pool, sender })
    }

    /// Queues a progress hint without waiting on the database. A full queue
    /// drops the hint; the next poll will send a fresher one.
    pub fn queue_progress_update(&self, update: ProgressUpdate) -> Result<()> {
        self.sender
            .try_send(update)
            .map_err(|err| anyhow::anyhow!("Failed to queue progress update: {err}"))
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn queue_max_capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn queue_available_capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_max_capacity()
            .saturating_sub(self.queue_available_capacity())
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn get_generation_task(&self, task_id: &str) -> Result<Option<GenerationTaskRow>> {
        let row = sqlx::query_as::<_, GenerationTaskRow>(
            "SELECT id, task_id, user_id, tokens_deducted, status, progress, error_message, refunded, created_at, updated_at \
             FROM generation_tasks WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Returns true when this call moved the task into `succeeded`.
    pub async fn mark_task_succeeded(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE generation_tasks \
             SET status = ?, progress = 100, updated_at = CURRENT_TIMESTAMP \
             WHERE task_id = ? AND status IN (?, ?)",
        )
        .bind(TaskStatus::Succeeded.as_str())
        .bind(task_id)
        .bind(TaskStatus::IN_FLIGHT[0].as_str())
        .bind(TaskStatus::IN_FLIGHT[1].as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks the task failed and refunds its tokens at most once.
    ///
    /// The conditional update is the only gate for the refund: a poll that
    /// does not get a row back from it never touches the ledger. Both writes
    /// share one transaction.
    pub async fn settle_task_failed(
        &self,
        task_id: &str,
        error_message: &str,
        refund_reason: &str,
    ) -> Result<FailureSettlement> {
        let mut tx = self.pool.begin().await?;

        let claim = sqlx::query_as::<_, FailedTaskClaim>(
            "UPDATE generation_tasks \
             SET status = ?, error_message = ?, \
                 refunded = CASE WHEN tokens_deducted > 0 THEN 1 ELSE 0 END, \
                 updated_at = CURRENT_TIMESTAMP \
             WHERE task_id = ? AND status IN (?, ?) \
             RETURNING user_id, tokens_deducted",
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(error_message)
        .bind(task_id)
        .bind(TaskStatus::IN_FLIGHT[0].as_str())
        .bind(TaskStatus::IN_FLIGHT[1].as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(claim) = claim else {
            tx.rollback().await?;
            return Ok(match self.get_generation_task(task_id).await? {
                Some(row) => FailureSettlement::AlreadySettled {
                    refunded: row.refunded,
                },
                None => FailureSettlement::NotTracked,
            });
        };

        if claim.tokens_deducted <= 0 {
            tx.commit().await?;
            return Ok(FailureSettlement::FailedWithoutRefund);
        }

        refund_tokens(&mut *tx, &claim.user_id, claim.tokens_deducted, refund_reason).await?;
        tx.commit().await?;

        Ok(FailureSettlement::Refunded {
            user_id: claim.user_id,
            amount: claim.tokens_deducted,
        })
    }

    /// Inserts images, skipping URLs the user already has. Returns the number
    /// of rows actually written. Either every row lands or none does.
    pub async fn insert_generated_images(&self, images: &[GeneratedImageInsert]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for image in images {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO generated_images \
                 (user_id, character_id, image_url, prompt, source, task_id) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&image.user_id)
            .bind(&image.character_id)
            .bind(&image.image_url)
            .bind(&image.prompt)
            .bind(&image.source)
            .bind(&image.task_id)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn find_image_urls_by_task_id(&self, task_id: &str) -> Result<Vec<String>> {
        let urls = sqlx::query_scalar::<_, String>(
            "SELECT image_url FROM generated_images WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(urls)
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS generation_tasks (\
            id INTEGER PRIMARY KEY AUTOINCREMENT,\
            task_id TEXT NOT NULL UNIQUE,\
            user_id TEXT NOT NULL,\
            tokens_deducted INTEGER NOT NULL DEFAULT 0,\
            status TEXT NOT NULL DEFAULT 'pending',\
            progress INTEGER NOT NULL DEFAULT 0,\
            error_message TEXT,\
            refunded INTEGER NOT NULL DEFAULT 0,\
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,\
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\
        );",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS generated_images (\
            id INTEGER PRIMARY KEY AUTOINCREMENT,\
            user_id TEXT NOT NULL,\
            character_id TEXT,\
            image_url TEXT NOT NULL,\
            prompt TEXT,\
            source TEXT NOT NULL,\
            task_id TEXT,\
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,\
            UNIQUE(user_id, image_url)\
        );",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_generated_images_task_id ON generated_images(task_id);",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_generated_images_user_id ON generated_images(user_id);",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS settings (\
            key TEXT PRIMARY KEY,\
            value TEXT NOT NULL,\
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\
        );",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS user_tokens (\
            user_id TEXT PRIMARY KEY,\
            balance INTEGER NOT NULL DEFAULT 0,\
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\
        );",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS token_transactions (\
            id INTEGER PRIMARY KEY AUTOINCREMENT,\
            user_id TEXT NOT NULL,\
            amount INTEGER NOT NULL,\
            kind TEXT NOT NULL,\
            reason TEXT,\
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\
        );",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_token_transactions_user_id ON token_transactions(user_id);",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn progress_writer(pool: SqlitePool, mut receiver: mpsc::Receiver<ProgressUpdate>) {
    while let Some(update) = receiver.recv().await {
        if let Err(err) = apply_progress_update(&pool, &update).await {
            warn!(
                "Error in progress_writer for task {}: {err}",
                update.task_id
            );
        }
    }

    info!("Progress writer task stopped");
}

async fn apply_progress_update(pool: &SqlitePool, update: &ProgressUpdate) -> Result<()> {
    sqlx::query(
        "UPDATE generation_tasks \
         SET status = ?, progress = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE task_id = ? AND status IN (?, ?)",
    )
    .bind(TaskStatus::Processing.as_str())
    .bind(update.progress.clamp(0, 100))
    .bind(&update.task_id)
    .bind(TaskStatus::IN_FLIGHT[0].as_str())
    .bind(TaskStatus::IN_FLIGHT[1].as_str())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
impl Database {
    pub async fn init_in_memory() -> Self {
        Database::init("sqlite::memory:", 1)
            .await
            .expect("in-memory database")
    }

    pub async fn seed_generation_task(
        &self,
        task_id: &str,
        user_id: &str,
        tokens_deducted: i64,
        status: &str,
    ) {
        sqlx::query(
            "INSERT INTO generation_tasks (task_id, user_id, tokens_deducted, status) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(user_id)
        .bind(tokens_deducted)
        .bind(status)
        .execute(&self.pool)
        .await
        .expect("seed generation task");
    }

    pub async fn seed_setting(&self, key: &str, value: &str) {
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .expect("seed setting");
    }

    pub async fn images_for_user(
        &self,
        user_id: &str,
    ) -> Vec<crate::db::models::GeneratedImageRow> {
        sqlx::query_as(
            "SELECT id, user_id, character_id, image_url, prompt, source, task_id, created_at \
             FROM generated_images WHERE user_id = ? ORDER BY id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .expect("images for user")
    }

    pub async fn refund_rows(&self, user_id: &str) -> Vec<(i64, String)> {
        sqlx::query_as(
            "SELECT amount, reason FROM token_transactions WHERE user_id = ? AND kind = 'refund' ORDER BY id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .expect("refund rows")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TaskStatus;

    fn image(user_id: &str, url: &str) -> GeneratedImageInsert {
        GeneratedImageInsert {
            user_id: user_id.to_string(),
            character_id: Some("char-1".to_string()),
            image_url: url.to_string(),
            prompt: Some("a cat in a hat".to_string()),
            source: "chat".to_string(),
            task_id: Some("t1".to_string()),
        }
    }

    #[tokio::test]
    async fn failed_settlement_refunds_once() {
        let db = Database::init_in_memory().await;
        db.seed_generation_task("t1", "user-1", 50, "processing").await;

        let first = db
            .settle_task_failed("t1", "vendor failed", "Refund for t1")
            .await
            .unwrap();
        let second = db
            .settle_task_failed("t1", "vendor failed", "Refund for t1")
            .await
            .unwrap();

        assert_eq!(
            first,
            FailureSettlement::Refunded {
                user_id: "user-1".to_string(),
                amount: 50
            }
        );
        assert_eq!(second, FailureSettlement::AlreadySettled { refunded: true });
        assert_eq!(db.refund_rows("user-1").await.len(), 1);

        let row = db.get_generation_task("t1").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(TaskStatus::Failed));
        assert_eq!(row.error_message.as_deref(), Some("vendor failed"));
        assert!(row.refunded);
    }

    #[tokio::test]
    async fn failed_settlement_without_tokens_skips_ledger() {
        let db = Database::init_in_memory().await;
        db.seed_generation_task("t1", "user-1", 0, "pending").await;

        let outcome = db.settle_task_failed("t1", "boom", "reason").await.unwrap();

        assert_eq!(outcome, FailureSettlement::FailedWithoutRefund);
        assert!(db.refund_rows("user-1").await.is_empty());
    }

    #[tokio::test]
    async fn terminal_tasks_are_not_resettled() {
        let db = Database::init_in_memory().await;
        db.seed_generation_task("t1", "user-1", 50, "succeeded").await;

        let outcome = db.settle_task_failed("t1", "late failure", "reason").await.unwrap();

        assert_eq!(outcome, FailureSettlement::AlreadySettled { refunded: false });
        let row = db.get_generation_task("t1").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(TaskStatus::Succeeded));
        assert!(db.refund_rows("user-1").await.is_empty());
    }

    #[tokio::test]
    async fn untracked_task_reports_not_tracked() {
        let db = Database::init_in_memory().await;
        let outcome = db.settle_task_failed("missing", "x", "y").await.unwrap();
        assert_eq!(outcome, FailureSettlement::NotTracked);
    }

    #[tokio::test]
    async fn success_transition_happens_once() {
        let db = Database::init_in_memory().await;
        db.seed_generation_task("t1", "user-1", 10, "processing").await;

        assert!(db.mark_task_succeeded("t1").await.unwrap());
        assert!(!db.mark_task_succeeded("t1").await.unwrap());

        let row = db.get_generation_task("t1").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(TaskStatus::Succeeded));
        assert_eq!(row.progress, 100);
    }

    #[tokio::test]
    async fn duplicate_image_urls_are_ignored() {
        let db = Database::init_in_memory().await;
        let images = vec![
            image("user-1", "https://cdn/a.png"),
            image("user-1", "https://cdn/b.png"),
        ];

        assert_eq!(db.insert_generated_images(&images).await.unwrap(), 2);
        assert_eq!(db.insert_generated_images(&images).await.unwrap(), 0);
        assert_eq!(db.images_for_user("user-1").await.len(), 2);
    }

    #[tokio::test]
    async fn failed_image_insert_writes_nothing() {
        let db = Database::init_in_memory().await;
        sqlx::query(
            "CREATE TRIGGER reject_bad_url BEFORE INSERT ON generated_images \
             WHEN NEW.image_url = 'https://cdn/bad.png' \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();
        let images = vec![
            image("user-1", "https://cdn/a.png"),
            image("user-1", "https://cdn/bad.png"),
            image("user-1", "https://cdn/c.png"),
        ];

        assert!(db.insert_generated_images(&images).await.is_err());
        assert!(db.images_for_user("user-1").await.is_empty());
    }

    #[tokio::test]
    async fn progress_updates_stop_at_terminal_states() {
        let db = Database::init_in_memory().await;
        db.seed_generation_task("live", "user-1", 10, "pending").await;
        db.seed_generation_task("done", "user-1", 10, "failed").await;

        for task_id in ["live", "done"] {
            apply_progress_update(
                db.pool(),
                &ProgressUpdate {
                    task_id: task_id.to_string(),
                    progress: 140,
                },
            )
            .await
            .unwrap();
        }

        let live = db.get_generation_task("live").await.unwrap().unwrap();
        assert_eq!(live.status(), Some(TaskStatus::Processing));
        assert_eq!(live.progress, 100);

        let done = db.get_generation_task("done").await.unwrap().unwrap();
        assert_eq!(done.status(), Some(TaskStatus::Failed));
        assert_eq!(done.progress, 0);
    }

    #[tokio::test]
    async fn reads_settings_and_task_images() {
        let db = Database::init_in_memory().await;
        db.seed_setting("novita_api_key", "sk-from-dashboard").await;
        db.insert_generated_images(&[image("user-1", "https://cdn/a.png")])
            .await
            .unwrap();

        assert_eq!(
            db.get_setting("novita_api_key").await.unwrap().as_deref(),
            Some("sk-from-dashboard")
        );
        assert_eq!(db.get_setting("missing").await.unwrap(), None);
        assert_eq!(
            db.find_image_urls_by_task_id("t1").await.unwrap(),
            vec!["https://cdn/a.png".to_string()]
        );
    }
}
