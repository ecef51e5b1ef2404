//! Shared helpers for tests that need a live Postgres.

use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::hash_password;
use crate::db;
use crate::models::{NewStudent, NewViolation, Role, Rule, RuleCategory, RuleInput, Student};

/// Pool on `TEST_DATABASE_URL` with the schema applied. Database tests
/// return early when the variable is unset.
pub async fn test_pool() -> Option<PgPool> {
    let _ = dotenvy::dotenv();
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    if url.is_empty() {
        return None;
    }
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .unwrap();
    db::init_db(&pool).await.unwrap();
    Some(pool)
}

fn tag() -> String {
    Uuid::new_v4().simple().to_string()
}

pub async fn student_with_login(pool: &PgPool) -> Student {
    let tag = tag();
    let email = format!("{tag}@polgan.ac.id");
    let account = db::create_user(
        pool,
        &email,
        &hash_password("rahasia123").unwrap(),
        Role::Mahasiswa,
        "Rina Siregar",
    )
    .await
    .unwrap();
    let student = NewStudent {
        nim: tag[..16].to_string(),
        name: "Rina Siregar".to_string(),
        email,
        program: "Teknik Informatika".to_string(),
        photo_url: None,
    };
    db::create_student(pool, Some(account.uid), &student).await.unwrap()
}

pub async fn lecturer(pool: &PgPool) -> Uuid {
    let email = format!("{}@polgan.ac.id", tag());
    db::create_user(pool, &email, "x", Role::Dosen, "Budi Santoso")
        .await
        .unwrap()
        .uid
}

pub async fn rule(pool: &PgPool, points: i32) -> Rule {
    let input = RuleInput {
        code: format!("T-{}", &tag()[..12]),
        name: "Membawa rokok ke kampus".to_string(),
        category: RuleCategory::Sedang,
        points,
    };
    db::create_rule(pool, &input).await.unwrap()
}

pub fn violation_for(student: &Student, rule: &Rule) -> NewViolation {
    NewViolation {
        student_id: student.id,
        rule_id: rule.id,
        occurred_on: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
        evidence_urls: Vec::new(),
        note: String::new(),
    }
}
