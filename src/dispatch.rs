use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::channels::{EmailSender, TelegramSender};
use crate::db::Db;
use crate::error::Error;
use crate::models::{DeliveryStats, DueReview, User, UserBatch};

/// Bound on each per-user due-review query so one slow store read cannot
/// stall the whole batch.
const STORE_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Collects the per-user due-sets handed to the dispatcher. Every known user
/// gets an entry, empty due-sets included. Each query runs under a timeout;
/// a failed or timed-out per-user query is counted and skipped. If the query
/// fails for every user the store is treated as unreachable and the run
/// fails with zero progress.
pub async fn user_batches(
    db: &Db,
    reference: NaiveDate,
) -> Result<(Vec<UserBatch>, u64), Error> {
    let users = db.list_users().await?;
    collect_batches(users, |user_id| {
        let query = db.due_reviews(user_id, reference);
        async move {
            match tokio::time::timeout(STORE_QUERY_TIMEOUT, query).await {
                Ok(result) => result,
                Err(_) => Err(Error::StoreUnavailable(format!(
                    "due-review query for user {} timed out",
                    user_id
                ))),
            }
        }
    })
    .await
}

async fn collect_batches<F, Fut>(
    users: Vec<User>,
    mut fetch: F,
) -> Result<(Vec<UserBatch>, u64), Error>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = Result<Vec<DueReview>, Error>>,
{
    let total = users.len();

    let mut batches = Vec::with_capacity(total);
    let mut store_errors = 0u64;
    for user in users {
        match fetch(user.id).await {
            Ok(reviews) => batches.push(UserBatch { user, reviews }),
            Err(err) => {
                log::error!("due-review query failed for user {}: {}", user.id, err);
                store_errors += 1;
            }
        }
    }

    if total > 0 && batches.is_empty() {
        return Err(Error::StoreUnavailable(format!(
            "due-review queries failed for all {} users",
            total
        )));
    }
    Ok((batches, store_errors))
}

/// Requests a running dispatch to stop issuing new sends. In-flight sends
/// finish and their outcomes stay in the statistics.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct Dispatcher<E, T> {
    email: E,
    telegram: T,
    concurrency: usize,
    send_timeout: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<E, T> Dispatcher<E, T>
where
    E: EmailSender + Clone + 'static,
    T: TelegramSender + Clone + 'static,
{
    pub fn new(email: E, telegram: T, concurrency: usize, send_timeout: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            email,
            telegram,
            concurrency: concurrency.max(1),
            send_timeout,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Sends reminders for every batch with a non-empty due-set and returns
    /// the aggregate statistics.
    ///
    /// Sends run concurrently across users, bounded by the configured
    /// concurrency limit; each channel send is a single best-effort attempt
    /// under a timeout. Failures are counted, never escalated.
    ///
    /// There is no idempotency key: running dispatch twice for the same day
    /// sends duplicate reminders. Once-per-day invocation is the caller's
    /// responsibility.
    pub async fn dispatch(&self, batches: Vec<UserBatch>) -> DeliveryStats {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for batch in batches {
            // Empty due-sets are skipped here, at the dispatcher boundary:
            // no attempt, no counter change.
            if batch.reviews.is_empty() {
                log::debug!("user {} has no due reviews, skipping", batch.user.username);
                continue;
            }
            if *self.shutdown_rx.borrow() {
                log::info!("shutdown requested, not issuing further sends");
                break;
            }

            let semaphore = semaphore.clone();
            let email = self.email.clone();
            let telegram = self.telegram.clone();
            let send_timeout = self.send_timeout;
            tasks.spawn(async move {
                // The semaphore is never closed; a permit always arrives.
                let _permit = semaphore.acquire_owned().await.ok();
                notify_user(&email, &telegram, &batch, send_timeout).await
            });
        }

        let mut stats = DeliveryStats::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => stats.merge(outcome),
                Err(err) => log::error!("send task failed to complete: {}", err),
            }
        }
        stats
    }
}

/// One user's sends: email if an address is registered, Telegram if a chat
/// id is registered. The channels are independent.
async fn notify_user<E: EmailSender, T: TelegramSender>(
    email: &E,
    telegram: &T,
    batch: &UserBatch,
    send_timeout: Duration,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    let user = &batch.user;

    if let Some(address) = &user.email {
        let (subject, body) = email_content(&user.username, &batch.reviews);
        match tokio::time::timeout(send_timeout, email.send(address, &subject, &body)).await {
            Ok(Ok(())) => stats.emails_sent += 1,
            Ok(Err(err)) => {
                log::warn!("email to {} failed: {}", user.username, err);
                stats.emails_failed += 1;
            }
            Err(_) => {
                log::warn!("email to {} timed out", user.username);
                stats.emails_failed += 1;
            }
        }
    }

    if let Some(chat_id) = &user.telegram_chat_id {
        let text = telegram_text(&user.username, &batch.reviews);
        match tokio::time::timeout(send_timeout, telegram.send(chat_id, &text)).await {
            Ok(Ok(())) => stats.telegram_sent += 1,
            Ok(Err(err)) => {
                log::warn!("telegram to {} failed: {}", user.username, err);
                stats.telegram_failed += 1;
            }
            Err(_) => {
                log::warn!("telegram to {} timed out", user.username);
                stats.telegram_failed += 1;
            }
        }
    }

    stats
}

// Reminder content. Reviews arrive already ordered by scheduled date, so the
// rendered lists are reproducible.

fn review_line(review: &DueReview) -> String {
    let flag = if review.is_overdue { "[OVERDUE] " } else { "" };
    format!(
        "- {}\"{}\" ({}), review #{} scheduled {}",
        flag,
        review.topic.title,
        review.topic.category,
        review.repetition.number,
        review.repetition.scheduled_date
    )
}

fn review_noun(count: usize) -> &'static str {
    if count == 1 {
        "review"
    } else {
        "reviews"
    }
}

pub fn email_content(username: &str, reviews: &[DueReview]) -> (String, String) {
    let subject = format!(
        "IntervalMind: {} {} waiting for you",
        reviews.len(),
        review_noun(reviews.len())
    );

    let mut body = format!(
        "Hi {},\n\nYou have {} {} to go through:\n\n",
        username,
        reviews.len(),
        review_noun(reviews.len())
    );
    for review in reviews {
        let _ = writeln!(body, "{}", review_line(review));
    }
    body.push_str("\nOpen IntervalMind to mark them done.\n");

    (subject, body)
}

pub fn telegram_text(username: &str, reviews: &[DueReview]) -> String {
    let mut text = format!(
        "\u{1F9E0} IntervalMind: {}, you have {} {} to go through:\n",
        username,
        reviews.len(),
        review_noun(reviews.len())
    );
    for review in reviews {
        let _ = writeln!(text, "{}", review_line(review));
    }
    text
}

/// The daily entry point: aggregate every user's due-set, dispatch, fold
/// aggregation store failures into the returned statistics.
pub async fn run_daily_dispatch<E, T>(
    db: &Db,
    dispatcher: &Dispatcher<E, T>,
    reference: NaiveDate,
) -> Result<DeliveryStats, Error>
where
    E: EmailSender + Clone + 'static,
    T: TelegramSender + Clone + 'static,
{
    let (batches, store_errors) = user_batches(db, reference).await?;
    log::info!(
        "dispatch run for {}: {} users, {} with due reviews",
        reference,
        batches.len(),
        batches.iter().filter(|b| !b.reviews.is_empty()).count()
    );

    let mut stats = dispatcher.dispatch(batches).await;
    stats.store_errors += store_errors;
    Ok(stats)
}
