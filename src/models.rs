use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Email channel address; `None` means no email reminders.
    pub email: Option<String>,
    /// Telegram channel address; `None` means no Telegram reminders.
    pub telegram_chat_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Topic {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

/// One scheduled review of a topic. Eight are created together when the
/// topic is scheduled; each transitions at most once from pending to
/// completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repetition {
    pub id: i64,
    pub topic_id: i64,
    /// Repetition number, 1..=8, unique per topic.
    pub number: i64,
    pub scheduled_date: NaiveDate,
    pub completed_date: Option<NaiveDate>,
    pub is_completed: bool,
    /// 1..=5, set only on completion.
    pub difficulty_rating: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for Repetition {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Repetition {
            id: row.try_get("id")?,
            topic_id: row.try_get("topic_id")?,
            number: row.try_get("repetition_number")?,
            scheduled_date: row.try_get("scheduled_date")?,
            completed_date: row.try_get("completed_date")?,
            is_completed: row.try_get("is_completed")?,
            difficulty_rating: row.try_get("difficulty_rating")?,
        })
    }
}

/// A due or overdue review joined to its owning topic. Derived per query,
/// never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DueReview {
    pub repetition: Repetition,
    pub topic: Topic,
    pub is_overdue: bool,
}

/// One user's due-set for a reference date. Users with an empty due-set are
/// still represented so the dispatch layer can account for them.
#[derive(Debug, Clone, Serialize)]
pub struct UserBatch {
    pub user: User,
    pub reviews: Vec<DueReview>,
}

/// Aggregate outcome of one dispatch run. Always produced, even when every
/// send fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub emails_sent: u64,
    pub emails_failed: u64,
    pub telegram_sent: u64,
    pub telegram_failed: u64,
    /// Per-user store failures during aggregation, kept separate from the
    /// channel counters.
    pub store_errors: u64,
}

impl DeliveryStats {
    pub fn merge(&mut self, other: DeliveryStats) {
        self.emails_sent += other.emails_sent;
        self.emails_failed += other.emails_failed;
        self.telegram_sent += other.telegram_sent;
        self.telegram_failed += other.telegram_failed;
        self.store_errors += other.store_errors;
    }
}

/// Read-only operational counts evaluated at a reference date.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub date: NaiveDate,
    pub total_users: i64,
    pub total_topics: i64,
    pub due_today: i64,
    pub overdue: i64,
    pub users_with_reviews: i64,
}
