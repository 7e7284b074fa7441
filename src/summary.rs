use chrono::NaiveDate;

use crate::db::Db;
use crate::error::Error;
use crate::models::SummaryReport;

/// Read-only operational counts at a reference date. Depends only on the
/// store; never touches the dispatcher.
pub async fn report(db: &Db, date: NaiveDate) -> Result<SummaryReport, Error> {
    Ok(SummaryReport {
        date,
        total_users: db.count_users().await?,
        total_topics: db.count_topics().await?,
        due_today: db.count_due_on(date).await?,
        overdue: db.count_overdue(date).await?,
        users_with_reviews: db.count_users_with_reviews(date).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule;

    #[tokio::test]
    async fn report_over_demo_data() {
        let db = Db::in_memory().await.unwrap();
        db.seed_demo().await.unwrap();

        // Demo topics are anchored five days back, so reviews #1 (+1d) and
        // #2 (+3d) are in the past and #3 (+7d) is not yet due. Three of
        // the eight #1/#2 pairs are already completed.
        let report = report(&db, schedule::today()).await.unwrap();

        assert_eq!(report.total_users, 1);
        assert_eq!(report.total_topics, 4);
        assert_eq!(report.due_today, 0);
        assert_eq!(report.overdue, 5);
        assert_eq!(report.users_with_reviews, 1);
    }

    #[tokio::test]
    async fn report_on_empty_store() {
        let db = Db::in_memory().await.unwrap();
        let report = report(&db, schedule::today()).await.unwrap();

        assert_eq!(report.total_users, 0);
        assert_eq!(report.total_topics, 0);
        assert_eq!(report.due_today, 0);
        assert_eq!(report.overdue, 0);
        assert_eq!(report.users_with_reviews, 0);
    }
}
