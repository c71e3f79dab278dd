use anyhow::{anyhow, Result};
use sqlx::SqliteConnection;
use tracing::info;

/// Credits `amount` tokens back to `user_id` and records a ledger entry.
///
/// Runs on the caller's connection so it can share a transaction with the
/// write that decided the refund is owed.
pub async fn refund_tokens(
    conn: &mut SqliteConnection,
    user_id: &str,
    amount: i64,
    reason: &str,
) -> Result<()> {
    if amount <= 0 {
        return Err(anyhow!("refund amount must be positive, got {amount}"));
    }

    sqlx::query(
        "INSERT INTO user_tokens (user_id, balance) VALUES (?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET \
         balance = balance + excluded.balance, \
         updated_at = CURRENT_TIMESTAMP",
    )
    .bind(user_id)
    .bind(amount)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT INTO token_transactions (user_id, amount, kind, reason) VALUES (?, ?, 'refund', ?)",
    )
    .bind(user_id)
    .bind(amount)
    .bind(reason)
    .execute(&mut *conn)
    .await?;

    info!("Refunded {amount} tokens to user {user_id}: {reason}");
    Ok(())
}

pub fn refund_reason(task_key: &str) -> String {
    format!("Refund for failed image generation (task {task_key})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::database::Database;

    async fn balance(db: &Database, user_id: &str) -> i64 {
        sqlx::query_scalar("SELECT balance FROM user_tokens WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn refunds_accumulate_on_balance() {
        let db = Database::init_in_memory().await;
        let mut conn = db.pool().acquire().await.unwrap();

        refund_tokens(&mut conn, "user-1", 50, "first").await.unwrap();
        refund_tokens(&mut conn, "user-1", 25, "second").await.unwrap();
        drop(conn);

        assert_eq!(balance(&db, "user-1").await, 75);
        let rows = db.refund_rows("user-1").await;
        assert_eq!(
            rows,
            vec![(50, "first".to_string()), (25, "second".to_string())]
        );
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts() {
        let db = Database::init_in_memory().await;
        let mut conn = db.pool().acquire().await.unwrap();

        assert!(refund_tokens(&mut conn, "user-1", 0, "noop").await.is_err());
    }

    #[test]
    fn reason_mentions_task() {
        assert_eq!(
            refund_reason("abc,def"),
            "Refund for failed image generation (task abc,def)"
        );
    }
}
