mod api;
mod channels;
mod db;
mod dispatch;
mod error;
mod models;
mod schedule;
mod summary;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};

use api::ApiState;
use channels::{EmailChannel, TelegramChannel};
use db::Db;
use dispatch::Dispatcher;

#[derive(Parser)]
#[command(name = "intervalmind", about = "Spaced repetition review reminders")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema, optionally with demo data
    Init {
        #[arg(long)]
        demo: bool,
    },
    /// Register a learner
    AddUser {
        username: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        telegram: Option<String>,
    },
    /// Create a topic together with its full review schedule
    AddTopic {
        title: String,
        #[arg(long)]
        user: i64,
        #[arg(long)]
        content: String,
        #[arg(long, default_value = "general")]
        category: String,
        /// Anchor date for the schedule (defaults to today, UTC)
        #[arg(long)]
        anchor: Option<NaiveDate>,
    },
    /// Generate the review schedule for a topic created without one
    Schedule {
        topic: i64,
        /// Anchor date for the schedule (defaults to today, UTC)
        #[arg(long)]
        anchor: Option<NaiveDate>,
    },
    /// Mark a review as completed
    Complete {
        repetition: i64,
        #[arg(long)]
        date: Option<NaiveDate>,
        /// How hard the recall felt, 1 (easy) to 5 (hard)
        #[arg(long)]
        rating: Option<i64>,
    },
    /// Send today's reminders through every configured channel
    Send,
    /// Show due/overdue counts at a reference date
    Summary {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },
}

struct Config {
    database_url: String,
    email_gateway_url: Option<String>,
    email_from: String,
    telegram_bot_token: Option<String>,
    concurrency: usize,
    send_timeout: Duration,
    bind_addr: String,
}

impl Config {
    fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://intervalmind.db?mode=rwc".into()),
            email_gateway_url: env::var("EMAIL_GATEWAY_URL").ok(),
            email_from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "reminders@intervalmind.local".into()),
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
            concurrency: env::var("DISPATCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            send_timeout: Duration::from_secs(
                env::var("SEND_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".into()),
        }
    }

    fn dispatcher(&self) -> anyhow::Result<Dispatcher<EmailChannel, TelegramChannel>> {
        let gateway = self
            .email_gateway_url
            .clone()
            .context("EMAIL_GATEWAY_URL is not set")?;
        let token = self
            .telegram_bot_token
            .clone()
            .context("TELEGRAM_BOT_TOKEN is not set")?;
        Ok(Dispatcher::new(
            EmailChannel::new(gateway, self.email_from.clone()),
            TelegramChannel::new(token),
            self.concurrency,
            self.send_timeout,
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let db = Db::connect(&config.database_url).await?;

    match cli.command {
        Command::Init { demo } => {
            if demo {
                db.seed_demo().await?;
            }
            println!("database ready at {}", config.database_url);
        }
        Command::AddUser {
            username,
            email,
            telegram,
        } => {
            let user = db
                .create_user(&username, email.as_deref(), telegram.as_deref())
                .await?;
            println!("created user {} (id {})", user.username, user.id);
        }
        Command::AddTopic {
            title,
            user,
            content,
            category,
            anchor,
        } => {
            let created_at = match anchor {
                Some(date) => date
                    .and_hms_opt(0, 0, 0)
                    .context("invalid anchor date")?
                    .and_utc(),
                None => Utc::now(),
            };
            let topic = db
                .create_topic(user, &title, &content, &category, created_at)
                .await?;
            let reps = db.topic_repetitions(topic.id).await?;
            println!(
                "created topic \"{}\" (id {}), first review {}, last review {}",
                topic.title,
                topic.id,
                reps[0].scheduled_date,
                reps[reps.len() - 1].scheduled_date
            );
        }
        Command::Schedule { topic, anchor } => {
            let reps = db
                .schedule_topic(topic, anchor.unwrap_or_else(schedule::today))
                .await?;
            println!(
                "scheduled topic {}: first review {}, last review {}",
                topic,
                reps[0].scheduled_date,
                reps[reps.len() - 1].scheduled_date
            );
        }
        Command::Complete {
            repetition,
            date,
            rating,
        } => {
            let done = db
                .complete_repetition(repetition, date.unwrap_or_else(schedule::today), rating)
                .await?;
            println!(
                "review #{} of topic {} completed on {}",
                done.number,
                done.topic_id,
                done.completed_date
                    .map(|d| d.to_string())
                    .unwrap_or_default()
            );
        }
        Command::Send => {
            let dispatcher = config.dispatcher()?;

            // Ctrl-C stops issuing new sends; in-flight sends finish and
            // stay in the statistics.
            let handle = dispatcher.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.shutdown();
                }
            });

            let stats = dispatch::run_daily_dispatch(&db, &dispatcher, schedule::today()).await?;
            println!("dispatch finished:");
            println!("  emails sent:     {}", stats.emails_sent);
            println!("  emails failed:   {}", stats.emails_failed);
            println!("  telegram sent:   {}", stats.telegram_sent);
            println!("  telegram failed: {}", stats.telegram_failed);
            if stats.store_errors > 0 {
                println!("  store errors:    {}", stats.store_errors);
            }
        }
        Command::Summary { date } => {
            let report = summary::report(&db, date.unwrap_or_else(schedule::today)).await?;
            println!("summary for {}:", report.date);
            println!("  users:                 {}", report.total_users);
            println!("  topics:                {}", report.total_topics);
            println!("  reviews due today:     {}", report.due_today);
            println!("  reviews overdue:       {}", report.overdue);
            println!("  users with reminders:  {}", report.users_with_reviews);
        }
        Command::Serve { addr } => {
            let dispatcher = Arc::new(config.dispatcher()?);
            let addr = addr.unwrap_or(config.bind_addr);
            let state = ApiState { db, dispatcher };

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            log::info!("listening on {}", addr);
            axum::serve(listener, api::app_router(state)).await?;
        }
    }

    Ok(())
}
