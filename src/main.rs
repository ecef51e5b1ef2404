use std::path::PathBuf;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{fmt, EnvFilter};

mod auth;
mod config;
mod db;
mod error;
mod guard;
mod http;
mod import;
mod models;
mod push;
mod report;
mod role_cache;
mod state;
mod status;
#[cfg(test)]
mod test_support;
mod uploads;

use config::Config;
use models::{Role, StudentFilter};
use state::AppState;

#[derive(Parser)]
#[command(name = "ganesha-discipline")]
#[command(about = "Student discipline tracker for Politeknik Ganesha Medan", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load starter rules, students and calendar events
    Seed,
    /// Create an administrator account
    CreateAdmin {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "Administrator")]
        name: String,
    },
    /// Import students (and their logins) from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Re-derive every student's points and status from their violations
    Recompute,
    /// Generate a markdown discipline report
    Report {
        #[arg(long)]
        program: Option<String>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Run the HTTP server
    Serve,
}

async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::load()?;
    let pool = connect(&config.database_url).await?;
    db::init_db(&pool).await?;
    let state = AppState::new(pool, config);
    http::serve(state).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Serve => return serve().await,
        command => command,
    };

    let pool = connect(&Config::database_url()?).await?;

    match command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::CreateAdmin {
            email,
            password,
            name,
        } => {
            auth::validate_password(&password).map_err(anyhow::Error::msg)?;
            let hash = auth::hash_password(&password)?;
            let account = db::create_user(&pool, &email, &hash, Role::Admin, &name).await?;
            println!("Admin {} created with uid {}.", account.email, account.uid);
        }
        Commands::Import { csv } => {
            let records = import::read_csv(&csv)
                .with_context(|| format!("failed to read {}", csv.display()))?;
            let directory = import::PgDirectory::new(&pool);
            let report = import::run_import(&directory, &records).await;
            println!(
                "Imported {} students from {}.",
                report.created,
                csv.display()
            );
            for failure in &report.failed {
                println!("- row {} ({}): {}", failure.row, failure.email, failure.reason);
            }
        }
        Commands::Recompute => {
            let count = db::recompute_all(&pool).await?;
            println!("Recomputed {count} students.");
        }
        Commands::Report {
            program,
            since_days,
            out,
        } => {
            let since = Utc::now().date_naive() - Duration::days(since_days.max(1));
            let filter = StudentFilter {
                program: program.clone(),
                ..StudentFilter::default()
            };
            let students = db::list_students(&pool, &filter).await?;
            let mut violations = db::recent_violations(&pool, since, 500).await?;
            if program.is_some() {
                let ids: std::collections::HashSet<_> = students.iter().map(|s| s.id).collect();
                violations.retain(|v| ids.contains(&v.student_id));
            }
            let thresholds = db::load_thresholds(&pool).await?;
            let report = report::build_report(
                program.as_deref(),
                since,
                &thresholds,
                &students,
                &violations,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Serve => {}
    }

    Ok(())
}
