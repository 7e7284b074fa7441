use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous,
};
use sqlx::{ConnectOptions, FromRow, Pool, Row, Sqlite};

use crate::error::Error;
use crate::models::{DueReview, Repetition, Topic, User};
use crate::schedule;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .log_statements(log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options).await?;

        let db = Db { pool };
        db.migrate().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, Error> {
        // A single connection so every test query sees the same database.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Db { pool };
        db.migrate().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT UNIQUE,
                telegram_chat_id TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'general',
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repetitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
                repetition_number INTEGER NOT NULL,
                scheduled_date DATE NOT NULL,
                completed_date DATE,
                is_completed BOOLEAN NOT NULL DEFAULT 0,
                difficulty_rating INTEGER,
                UNIQUE (topic_id, repetition_number)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_repetitions_due
             ON repetitions(is_completed, scheduled_date)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_topics_user ON topics(user_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // User operations

    pub async fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        telegram_chat_id: Option<&str>,
    ) -> Result<User, Error> {
        let result = sqlx::query(
            "INSERT INTO users (username, email, telegram_chat_id) VALUES (?, ?, ?)",
        )
        .bind(username)
        .bind(email)
        .bind(telegram_chat_id)
        .execute(&self.pool)
        .await?;

        Ok(User {
            id: result.last_insert_rowid(),
            username: username.to_string(),
            email: email.map(str::to_string),
            telegram_chat_id: telegram_chat_id.map(str::to_string),
        })
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, Error> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, email, telegram_chat_id FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, Error> {
        let users = sqlx::query_as::<_, User>(
            "SELECT id, username, email, telegram_chat_id FROM users ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    // Topic and schedule operations

    /// Inserts a topic together with its full repetition schedule in one
    /// transaction. A topic never exists with a partial schedule.
    pub async fn create_topic(
        &self,
        user_id: i64,
        title: &str,
        content: &str,
        category: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Topic, Error> {
        if self.get_user(user_id).await?.is_none() {
            return Err(Error::UnknownUser(user_id));
        }

        let anchor = schedule::anchor_date(created_at);
        let dates = schedule::review_dates(anchor)?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO topics (user_id, title, content, category, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(title)
        .bind(content)
        .bind(category)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;
        let topic_id = result.last_insert_rowid();

        for (i, date) in dates.iter().enumerate() {
            sqlx::query(
                "INSERT INTO repetitions (topic_id, repetition_number, scheduled_date)
                 VALUES (?, ?, ?)",
            )
            .bind(topic_id)
            .bind((i + 1) as i64)
            .bind(date)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Topic {
            id: topic_id,
            user_id,
            title: title.to_string(),
            content: content.to_string(),
            category: category.to_string(),
            created_at,
        })
    }

    /// Generates the schedule for an existing topic that has none yet.
    /// Schedules are only ever created whole, never amended.
    pub async fn schedule_topic(
        &self,
        topic_id: i64,
        anchor: NaiveDate,
    ) -> Result<Vec<Repetition>, Error> {
        if self.get_topic(topic_id).await?.is_none() {
            return Err(Error::UnknownTopic(topic_id));
        }

        let dates = schedule::review_dates(anchor)?;

        let mut tx = self.pool.begin().await?;

        let existing: i64 =
            sqlx::query_scalar("SELECT count(*) FROM repetitions WHERE topic_id = ?")
                .bind(topic_id)
                .fetch_one(&mut *tx)
                .await?;
        if existing > 0 {
            return Err(Error::AlreadyScheduled(topic_id));
        }

        for (i, date) in dates.iter().enumerate() {
            sqlx::query(
                "INSERT INTO repetitions (topic_id, repetition_number, scheduled_date)
                 VALUES (?, ?, ?)",
            )
            .bind(topic_id)
            .bind((i + 1) as i64)
            .bind(date)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.topic_repetitions(topic_id).await
    }

    pub async fn get_topic(&self, id: i64) -> Result<Option<Topic>, Error> {
        let topic = sqlx::query_as::<_, Topic>(
            "SELECT id, user_id, title, content, category, created_at
             FROM topics WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(topic)
    }

    pub async fn topic_repetitions(&self, topic_id: i64) -> Result<Vec<Repetition>, Error> {
        let reps = sqlx::query_as::<_, Repetition>(
            "SELECT id, topic_id, repetition_number, scheduled_date,
                    completed_date, is_completed, difficulty_rating
             FROM repetitions WHERE topic_id = ?
             ORDER BY repetition_number",
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(reps)
    }

    // Completion

    /// Marks a pending repetition completed. One-way: completing an already
    /// completed repetition fails and leaves the first completion untouched.
    pub async fn complete_repetition(
        &self,
        id: i64,
        completed_date: NaiveDate,
        difficulty_rating: Option<i64>,
    ) -> Result<Repetition, Error> {
        if let Some(rating) = difficulty_rating {
            if !(1..=5).contains(&rating) {
                return Err(Error::InvalidDifficultyRating(rating));
            }
        }

        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Repetition>(
            "SELECT id, topic_id, repetition_number, scheduled_date,
                    completed_date, is_completed, difficulty_rating
             FROM repetitions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut repetition = match current {
            Some(r) => r,
            None => return Err(Error::UnknownRepetition(id)),
        };
        if repetition.is_completed {
            return Err(Error::AlreadyCompleted(id));
        }

        sqlx::query(
            "UPDATE repetitions
             SET is_completed = 1, completed_date = ?, difficulty_rating = ?
             WHERE id = ?",
        )
        .bind(completed_date)
        .bind(difficulty_rating)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        repetition.is_completed = true;
        repetition.completed_date = Some(completed_date);
        repetition.difficulty_rating = difficulty_rating;
        Ok(repetition)
    }

    // Due-review aggregation

    /// All of a user's pending reviews scheduled on or before the reference
    /// date, joined to their topics. Ordered by scheduled date, then
    /// repetition number, so reminder content is reproducible.
    pub async fn due_reviews(
        &self,
        user_id: i64,
        reference: NaiveDate,
    ) -> Result<Vec<DueReview>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.topic_id, r.repetition_number, r.scheduled_date,
                   r.completed_date, r.is_completed, r.difficulty_rating,
                   t.user_id, t.title, t.content, t.category, t.created_at
            FROM repetitions r
            JOIN topics t ON t.id = r.topic_id
            WHERE t.user_id = ?
              AND r.is_completed = 0
              AND r.scheduled_date <= ?
            ORDER BY r.scheduled_date ASC, r.repetition_number ASC
            "#,
        )
        .bind(user_id)
        .bind(reference)
        .fetch_all(&self.pool)
        .await?;

        let mut reviews = Vec::with_capacity(rows.len());
        for row in rows {
            let repetition = Repetition::from_row(&row)?;
            let topic = Topic {
                id: repetition.topic_id,
                user_id: row.try_get("user_id")?,
                title: row.try_get("title")?,
                content: row.try_get("content")?,
                category: row.try_get("category")?,
                created_at: row.try_get("created_at")?,
            };
            let is_overdue = schedule::is_overdue(repetition.scheduled_date, reference);
            reviews.push(DueReview {
                repetition,
                topic,
                is_overdue,
            });
        }
        Ok(reviews)
    }

    // Summary counts

    pub async fn count_users(&self) -> Result<i64, Error> {
        let count = sqlx::query_scalar("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_topics(&self) -> Result<i64, Error> {
        let count = sqlx::query_scalar("SELECT count(*) FROM topics")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_due_on(&self, reference: NaiveDate) -> Result<i64, Error> {
        let count = sqlx::query_scalar(
            "SELECT count(*) FROM repetitions
             WHERE scheduled_date = ? AND is_completed = 0",
        )
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_overdue(&self, reference: NaiveDate) -> Result<i64, Error> {
        let count = sqlx::query_scalar(
            "SELECT count(*) FROM repetitions
             WHERE scheduled_date < ? AND is_completed = 0",
        )
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_users_with_reviews(&self, reference: NaiveDate) -> Result<i64, Error> {
        let count = sqlx::query_scalar(
            "SELECT count(DISTINCT t.user_id)
             FROM repetitions r
             JOIN topics t ON t.id = r.topic_id
             WHERE r.scheduled_date <= ? AND r.is_completed = 0",
        )
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // Demo data

    /// Seeds one demo user with a handful of topics anchored five days back,
    /// a few of them already partially reviewed.
    pub async fn seed_demo(&self) -> Result<(), Error> {
        let user = self
            .create_user("testuser", Some("test@example.com"), None)
            .await?;
        let created_at = Utc::now() - Duration::days(5);

        let topics = [
            (
                "English word: Serendipity",
                "Serendipity: a happy accident, the knack of making pleasant \
                 and unexpected discoveries.",
                "language",
            ),
            (
                "Founding of Moscow",
                "Moscow was founded in 1147 by Prince Yuri Dolgoruky; the \
                 first chronicle mention is dated April 4, 1147.",
                "history",
            ),
            (
                "Area of a circle",
                "S = pi * r^2, where r is the radius. Equivalently \
                 S = pi * (d / 2)^2 for diameter d.",
                "science",
            ),
            (
                "How HTTP works",
                "Request/response protocol between client and server. Main \
                 methods: GET, POST, PUT, DELETE. Statuses: 200, 404, 500.",
                "science",
            ),
        ];

        let mut created = Vec::new();
        for (title, content, category) in topics {
            created.push(
                self.create_topic(user.id, title, content, category, created_at)
                    .await?,
            );
        }

        // First topic: two reviews done. Second topic: one.
        let anchor = schedule::anchor_date(created_at);
        let first = self.topic_repetitions(created[0].id).await?;
        self.complete_repetition(first[0].id, anchor + Duration::days(1), Some(4))
            .await?;
        self.complete_repetition(first[1].id, anchor + Duration::days(3), Some(3))
            .await?;

        let second = self.topic_repetitions(created[1].id).await?;
        self.complete_repetition(second[0].id, anchor + Duration::days(1), Some(5))
            .await?;

        log::info!("seeded demo data: 1 user, {} topics", created.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn midnight(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        date(y, m, d).and_hms_opt(0, 0, 0).unwrap().and_utc()
    }

    async fn db_with_user() -> (Db, User) {
        let db = Db::in_memory().await.unwrap();
        let user = db
            .create_user("alice", Some("alice@example.com"), Some("1001"))
            .await
            .unwrap();
        (db, user)
    }

    #[tokio::test]
    async fn topic_creation_emits_full_schedule() {
        let (db, user) = db_with_user().await;
        let topic = db
            .create_topic(user.id, "t", "c", "general", midnight(2024, 1, 1))
            .await
            .unwrap();

        let reps = db.topic_repetitions(topic.id).await.unwrap();
        assert_eq!(reps.len(), 8);
        for (i, rep) in reps.iter().enumerate() {
            assert_eq!(rep.number, (i + 1) as i64);
            assert!(!rep.is_completed);
            assert!(rep.completed_date.is_none());
            assert!(rep.difficulty_rating.is_none());
        }
        assert_eq!(reps[0].scheduled_date, date(2024, 1, 2));
        assert_eq!(reps[1].scheduled_date, date(2024, 1, 4));
        assert_eq!(reps[2].scheduled_date, date(2024, 1, 8));
        // +365 days across the 2024 leap year
        assert_eq!(reps[7].scheduled_date, date(2024, 12, 31));
    }

    #[tokio::test]
    async fn create_topic_requires_existing_user() {
        let db = Db::in_memory().await.unwrap();
        let err = db
            .create_topic(99, "t", "c", "general", midnight(2024, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownUser(99)));
    }

    #[tokio::test]
    async fn schedule_topic_rejects_unknown_and_already_scheduled() {
        let (db, user) = db_with_user().await;

        let err = db.schedule_topic(42, date(2024, 1, 1)).await.unwrap_err();
        assert!(matches!(err, Error::UnknownTopic(42)));

        let topic = db
            .create_topic(user.id, "t", "c", "general", midnight(2024, 1, 1))
            .await
            .unwrap();
        let err = db
            .schedule_topic(topic.id, date(2024, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyScheduled(_)));
    }

    #[tokio::test]
    async fn schedule_topic_backfills_unscheduled_topic() {
        let (db, user) = db_with_user().await;

        // A topic inserted without its schedule; create_topic never does
        // this, but imported or hand-edited data can.
        let result = sqlx::query(
            "INSERT INTO topics (user_id, title, content, category, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind("bare")
        .bind("c")
        .bind("general")
        .bind(midnight(2024, 1, 1))
        .execute(db.pool())
        .await
        .unwrap();
        let topic_id = result.last_insert_rowid();

        let reps = db.schedule_topic(topic_id, date(2024, 1, 1)).await.unwrap();
        assert_eq!(reps.len(), 8);
        assert_eq!(reps[0].scheduled_date, date(2024, 1, 2));
        assert_eq!(reps[7].scheduled_date, date(2024, 12, 31));
        assert!(reps.iter().all(|r| !r.is_completed));
    }

    #[tokio::test]
    async fn completion_is_one_way() {
        let (db, user) = db_with_user().await;
        let topic = db
            .create_topic(user.id, "t", "c", "general", midnight(2024, 1, 1))
            .await
            .unwrap();
        let reps = db.topic_repetitions(topic.id).await.unwrap();

        let done = db
            .complete_repetition(reps[0].id, date(2024, 1, 3), Some(4))
            .await
            .unwrap();
        assert!(done.is_completed);
        assert_eq!(done.completed_date, Some(date(2024, 1, 3)));
        assert_eq!(done.difficulty_rating, Some(4));

        let err = db
            .complete_repetition(reps[0].id, date(2024, 1, 9), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyCompleted(_)));

        // First completion's data must be unchanged.
        let reps = db.topic_repetitions(topic.id).await.unwrap();
        assert_eq!(reps[0].completed_date, Some(date(2024, 1, 3)));
        assert_eq!(reps[0].difficulty_rating, Some(4));
    }

    #[tokio::test]
    async fn completion_validates_rating_and_id() {
        let (db, user) = db_with_user().await;
        let topic = db
            .create_topic(user.id, "t", "c", "general", midnight(2024, 1, 1))
            .await
            .unwrap();
        let reps = db.topic_repetitions(topic.id).await.unwrap();

        let err = db
            .complete_repetition(reps[0].id, date(2024, 1, 3), Some(6))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDifficultyRating(6)));

        let err = db
            .complete_repetition(9999, date(2024, 1, 3), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRepetition(9999)));

        // Rating is optional.
        let done = db
            .complete_repetition(reps[0].id, date(2024, 1, 3), None)
            .await
            .unwrap();
        assert_eq!(done.difficulty_rating, None);
    }

    #[tokio::test]
    async fn due_reviews_membership_order_and_overdue() {
        let (db, user) = db_with_user().await;
        let topic = db
            .create_topic(user.id, "t", "c", "general", midnight(2024, 1, 1))
            .await
            .unwrap();
        let reps = db.topic_repetitions(topic.id).await.unwrap();

        // #1 (2024-01-02) completed; #2 (2024-01-04) pending.
        db.complete_repetition(reps[0].id, date(2024, 1, 2), Some(3))
            .await
            .unwrap();

        let due = db.due_reviews(user.id, date(2024, 1, 5)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].repetition.number, 2);
        assert_eq!(due[0].repetition.scheduled_date, date(2024, 1, 4));
        assert!(due[0].is_overdue);
        assert_eq!(due[0].topic.id, topic.id);

        // Due on exactly the reference date is included but not overdue.
        let due = db.due_reviews(user.id, date(2024, 1, 4)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(!due[0].is_overdue);

        // Nothing scheduled after the reference date appears.
        let due = db.due_reviews(user.id, date(2024, 1, 1)).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn due_reviews_ordering_across_topics() {
        let (db, user) = db_with_user().await;
        let a = db
            .create_topic(user.id, "a", "c", "general", midnight(2024, 1, 1))
            .await
            .unwrap();
        let b = db
            .create_topic(user.id, "b", "c", "general", midnight(2024, 1, 3))
            .await
            .unwrap();

        let due = db.due_reviews(user.id, date(2024, 1, 8)).await.unwrap();
        // a#1 01-02, then the 01-04 tie breaks by repetition number
        // (b#1 before a#2), then b#2 01-06, a#3 01-08.
        let got: Vec<(i64, i64)> = due
            .iter()
            .map(|r| (r.topic.id, r.repetition.number))
            .collect();
        assert_eq!(
            got,
            vec![(a.id, 1), (b.id, 1), (a.id, 2), (b.id, 2), (a.id, 3)]
        );

        let dates: Vec<NaiveDate> = due.iter().map(|r| r.repetition.scheduled_date).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);
    }

    #[tokio::test]
    async fn due_reviews_ignore_other_users() {
        let (db, alice) = db_with_user().await;
        let bob = db.create_user("bob", None, None).await.unwrap();
        db.create_topic(bob.id, "bob topic", "c", "general", midnight(2024, 1, 1))
            .await
            .unwrap();

        let due = db.due_reviews(alice.id, date(2024, 2, 1)).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn summary_counts() {
        let (db, user) = db_with_user().await;
        db.create_topic(user.id, "t", "c", "general", midnight(2024, 1, 1))
            .await
            .unwrap();

        // On 2024-01-04: #1 (01-02) overdue, #2 (01-04) due today.
        let reference = date(2024, 1, 4);
        assert_eq!(db.count_users().await.unwrap(), 1);
        assert_eq!(db.count_topics().await.unwrap(), 1);
        assert_eq!(db.count_due_on(reference).await.unwrap(), 1);
        assert_eq!(db.count_overdue(reference).await.unwrap(), 1);
        assert_eq!(db.count_users_with_reviews(reference).await.unwrap(), 1);

        // Before anything is due.
        let early = date(2024, 1, 1);
        assert_eq!(db.count_due_on(early).await.unwrap(), 0);
        assert_eq!(db.count_overdue(early).await.unwrap(), 0);
        assert_eq!(db.count_users_with_reviews(early).await.unwrap(), 0);
    }
}
