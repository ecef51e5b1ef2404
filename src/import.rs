//! Bulk student import.
//!
//! Each record becomes an auth account plus a student row. Records are
//! independent: a bad record is reported and the batch moves on. When the
//! student row cannot be written after its account was created, the account
//! is deleted again so no orphan login remains.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{hash_password, validate_email, validate_password};
use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::{NewStudent, Role};

#[derive(Debug, Clone, Deserialize)]
pub struct ImportRecord {
    pub nim: String,
    pub name: String,
    pub email: String,
    pub program: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportFailure {
    /// 1-based position in the submitted batch.
    pub row: usize,
    pub email: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub created: usize,
    pub failed: Vec<ImportFailure>,
}

#[async_trait]
pub trait StudentDirectory: Send + Sync {
    async fn email_registered(&self, email: &str) -> AppResult<bool>;

    async fn create_account(&self, email: &str, password: &str, display_name: &str) -> AppResult<Uuid>;

    /// Must succeed when the account is already gone.
    async fn delete_account(&self, uid: Uuid) -> AppResult<()>;

    async fn insert_student(&self, uid: Uuid, student: &NewStudent) -> AppResult<Uuid>;
}

fn validate(record: &ImportRecord) -> Result<(), String> {
    if record.nim.trim().is_empty() {
        return Err("nim is required".to_string());
    }
    if record.name.trim().is_empty() {
        return Err("name is required".to_string());
    }
    if record.program.trim().is_empty() {
        return Err("program is required".to_string());
    }
    validate_email(record.email.trim())
}

pub async fn run_import(directory: &dyn StudentDirectory, records: &[ImportRecord]) -> ImportReport {
    let mut report = ImportReport::default();
    let mut seen: HashSet<String> = HashSet::new();

    for (index, record) in records.iter().enumerate() {
        let row = index + 1;
        let email = record.email.trim().to_lowercase();
        let fail = |reason: String| ImportFailure {
            row,
            email: email.clone(),
            reason,
        };

        if let Err(reason) = validate(record) {
            report.failed.push(fail(reason));
            continue;
        }

        let password = record
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| record.nim.trim().to_string());
        if let Err(reason) = validate_password(&password) {
            report.failed.push(fail(reason));
            continue;
        }

        if !seen.insert(email.clone()) {
            report
                .failed
                .push(fail("email appears more than once in this import".to_string()));
            continue;
        }

        match directory.email_registered(&email).await {
            Ok(false) => {}
            Ok(true) => {
                report.failed.push(fail("email already registered".to_string()));
                continue;
            }
            Err(e) => {
                report.failed.push(fail(e.to_string()));
                continue;
            }
        }

        let uid = match directory
            .create_account(&email, &password, record.name.trim())
            .await
        {
            Ok(uid) => uid,
            Err(e) => {
                report.failed.push(fail(format!("account creation failed: {e}")));
                continue;
            }
        };

        let student = NewStudent {
            nim: record.nim.trim().to_string(),
            name: record.name.trim().to_string(),
            email: email.clone(),
            program: record.program.trim().to_string(),
            photo_url: None,
        };

        match directory.insert_student(uid, &student).await {
            Ok(_) => report.created += 1,
            Err(e) => {
                warn!(%email, "student insert failed, removing account: {e}");
                if let Err(cleanup) = directory.delete_account(uid).await {
                    error!(%uid, "compensating account delete failed: {cleanup}");
                }
                report.failed.push(fail(format!("student record not saved: {e}")));
            }
        }
    }

    info!(
        created = report.created,
        failed = report.failed.len(),
        "student import finished"
    );
    report
}

pub fn read_csv(path: &Path) -> anyhow::Result<Vec<ImportRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for result in reader.deserialize::<ImportRecord>() {
        records.push(result?);
    }
    Ok(records)
}

/// Postgres-backed directory: accounts live in `users`, students in
/// `students`.
pub struct PgDirectory<'a> {
    pool: &'a PgPool,
}

impl<'a> PgDirectory<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StudentDirectory for PgDirectory<'_> {
    async fn email_registered(&self, email: &str) -> AppResult<bool> {
        Ok(db::find_user_by_email(self.pool, email).await?.is_some()
            || db::student_email_exists(self.pool, email).await?)
    }

    async fn create_account(&self, email: &str, password: &str, display_name: &str) -> AppResult<Uuid> {
        let hash = hash_password(password).map_err(|e| AppError::Internal(e.to_string()))?;
        let account = db::create_user(self.pool, email, &hash, Role::Mahasiswa, display_name).await?;
        Ok(account.uid)
    }

    async fn delete_account(&self, uid: Uuid) -> AppResult<()> {
        db::delete_user(self.pool, uid).await?;
        Ok(())
    }

    async fn insert_student(&self, uid: Uuid, student: &NewStudent) -> AppResult<Uuid> {
        let created = db::create_student(self.pool, Some(uid), student).await?;
        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDirectory {
        accounts: Mutex<HashMap<Uuid, String>>,
        students: Mutex<Vec<(Uuid, NewStudent)>>,
        fail_insert_for: Option<String>,
        deleted: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl StudentDirectory for FakeDirectory {
        async fn email_registered(&self, email: &str) -> AppResult<bool> {
            Ok(self.accounts.lock().unwrap().values().any(|e| e == email))
        }

        async fn create_account(&self, email: &str, _password: &str, _name: &str) -> AppResult<Uuid> {
            let uid = Uuid::new_v4();
            self.accounts.lock().unwrap().insert(uid, email.to_string());
            Ok(uid)
        }

        async fn delete_account(&self, uid: Uuid) -> AppResult<()> {
            self.accounts.lock().unwrap().remove(&uid);
            self.deleted.lock().unwrap().push(uid);
            Ok(())
        }

        async fn insert_student(&self, uid: Uuid, student: &NewStudent) -> AppResult<Uuid> {
            if self.fail_insert_for.as_deref() == Some(student.email.as_str()) {
                return Err(AppError::Internal("write rejected".into()));
            }
            self.students.lock().unwrap().push((uid, student.clone()));
            Ok(Uuid::new_v4())
        }
    }

    fn record(nim: &str, email: &str) -> ImportRecord {
        ImportRecord {
            nim: nim.to_string(),
            name: format!("Mahasiswa {nim}"),
            email: email.to_string(),
            program: "Teknik Informatika".to_string(),
            password: None,
        }
    }

    #[tokio::test]
    async fn imports_all_valid_records() {
        let directory = FakeDirectory::default();
        let records = vec![record("2201001", "a@polgan.ac.id"), record("2201002", "b@polgan.ac.id")];

        let report = run_import(&directory, &records).await;

        assert_eq!(report.created, 2);
        assert!(report.failed.is_empty());
        assert_eq!(directory.students.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_without_aborting_batch() {
        let directory = FakeDirectory::default();
        directory
            .accounts
            .lock()
            .unwrap()
            .insert(Uuid::new_v4(), "taken@polgan.ac.id".to_string());

        let records = vec![
            record("2201001", "taken@polgan.ac.id"),
            record("2201002", "fresh@polgan.ac.id"),
            record("2201003", "FRESH@polgan.ac.id"),
            record("2201004", "other@polgan.ac.id"),
        ];

        let report = run_import(&directory, &records).await;

        assert_eq!(report.created, 2);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].row, 1);
        assert_eq!(report.failed[0].reason, "email already registered");
        assert_eq!(report.failed[1].row, 3);
        assert_eq!(report.failed[1].email, "fresh@polgan.ac.id");
    }

    #[tokio::test]
    async fn failed_student_write_removes_created_account() {
        let directory = FakeDirectory {
            fail_insert_for: Some("broken@polgan.ac.id".to_string()),
            ..FakeDirectory::default()
        };
        let records = vec![
            record("2201001", "broken@polgan.ac.id"),
            record("2201002", "ok@polgan.ac.id"),
        ];

        let report = run_import(&directory, &records).await;

        assert_eq!(report.created, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.starts_with("student record not saved"));
        assert_eq!(directory.deleted.lock().unwrap().len(), 1);
        let accounts = directory.accounts.lock().unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(accounts.values().all(|e| e == "ok@polgan.ac.id"));
    }

    #[tokio::test]
    async fn invalid_records_are_reported() {
        let directory = FakeDirectory::default();
        let mut no_program = record("2201001", "a@polgan.ac.id");
        no_program.program = " ".to_string();
        let records = vec![
            no_program,
            record("2201002", "not-an-email"),
            record("123", "short@polgan.ac.id"),
        ];

        let report = run_import(&directory, &records).await;

        assert_eq!(report.created, 0);
        let reasons: Vec<&str> = report.failed.iter().map(|f| f.reason.as_str()).collect();
        assert_eq!(reasons[0], "program is required");
        assert!(reasons[1].starts_with("invalid email"));
        assert!(reasons[2].starts_with("password must be at least"));
        assert!(directory.accounts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_password_overrides_nim_default() {
        let directory = FakeDirectory::default();
        let mut with_password = record("123", "p@polgan.ac.id");
        with_password.password = Some("rahasia-kuat".to_string());

        let report = run_import(&directory, &[with_password]).await;

        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn postgres_account_delete_is_idempotent() {
        let Some(pool) = crate::test_support::test_pool().await else {
            return;
        };
        let directory = PgDirectory::new(&pool);
        let uid = directory
            .create_account(&format!("{}@polgan.ac.id", Uuid::new_v4().simple()), "2201001", "Rina")
            .await
            .unwrap();

        directory.delete_account(uid).await.unwrap();
        directory.delete_account(uid).await.unwrap();
        directory.delete_account(Uuid::new_v4()).await.unwrap();
        assert!(db::find_user(&pool, uid).await.unwrap().is_none());
    }
}
