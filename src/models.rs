use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::StudentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Dosen,
    Mahasiswa,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Dosen, Role::Mahasiswa];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Dosen => "dosen",
            Role::Mahasiswa => "mahasiswa",
        }
    }

    /// Path prefix guarded for this role, e.g. `/dosen`.
    pub fn prefix(self) -> &'static str {
        match self {
            Role::Admin => "/admin",
            Role::Dosen => "/dosen",
            Role::Mahasiswa => "/mahasiswa",
        }
    }

    pub fn dashboard(self) -> &'static str {
        match self {
            Role::Admin => "/admin/dashboard",
            Role::Dosen => "/dosen/dashboard",
            Role::Mahasiswa => "/mahasiswa/dashboard",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "dosen" => Ok(Role::Dosen),
            "mahasiswa" => Ok(Role::Mahasiswa),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserAccount {
    pub uid: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Student {
    pub id: Uuid,
    pub uid: Option<Uuid>,
    pub nim: String,
    pub name: String,
    pub email: String,
    pub program: String,
    pub points: i32,
    pub status: StudentStatus,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStudent {
    pub nim: String,
    pub name: String,
    pub email: String,
    pub program: String,
    #[serde(default)]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentUpdate {
    pub name: Option<String>,
    pub program: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentFilter {
    pub program: Option<String>,
    pub status: Option<StudentStatus>,
    pub q: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Ringan,
    Sedang,
    Berat,
}

impl RuleCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleCategory::Ringan => "ringan",
            RuleCategory::Sedang => "sedang",
            RuleCategory::Berat => "berat",
        }
    }
}

impl FromStr for RuleCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ringan" => Ok(RuleCategory::Ringan),
            "sedang" => Ok(RuleCategory::Sedang),
            "berat" => Ok(RuleCategory::Berat),
            other => Err(format!("unknown rule category '{other}'")),
        }
    }
}

/// A peraturan: a rule students can break, worth a fixed number of points.
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub category: RuleCategory,
    pub points: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleInput {
    pub code: String,
    pub name: String,
    pub category: RuleCategory,
    pub points: i32,
}

/// A pelanggaran. `points` is copied from the rule when recorded so later
/// edits to the rule do not rewrite history.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub id: Uuid,
    pub student_id: Uuid,
    pub student_name: String,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub occurred_on: NaiveDate,
    pub points: i32,
    pub evidence_urls: Vec<String>,
    pub note: String,
    pub reported_by: Option<Uuid>,
    pub voided: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewViolation {
    pub student_id: Uuid,
    pub rule_id: Uuid,
    pub occurred_on: NaiveDate,
    #[serde(default)]
    pub evidence_urls: Vec<String>,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppealStatus {
    Pending,
    Accepted,
    Rejected,
}

impl AppealStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppealStatus::Pending => "pending",
            AppealStatus::Accepted => "accepted",
            AppealStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for AppealStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(AppealStatus::Pending),
            "accepted" => Ok(AppealStatus::Accepted),
            "rejected" => Ok(AppealStatus::Rejected),
            other => Err(format!("unknown appeal status '{other}'")),
        }
    }
}

/// A banding filed by a student against one of their violations.
#[derive(Debug, Clone, Serialize)]
pub struct Appeal {
    pub id: Uuid,
    pub violation_id: Uuid,
    pub student_id: Uuid,
    pub reason: String,
    pub status: AppealStatus,
    pub response: Option<String>,
    pub reviewed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAppeal {
    pub violation_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppealDecision {
    pub accept: bool,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Announcement {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub published_on: NaiveDate,
    pub image_url: Option<String>,
    pub author_uid: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnouncementInput {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub published_on: Option<NaiveDate>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Violation,
    Appeal,
    Announcement,
    General,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Violation => "violation",
            NotificationKind::Appeal => "appeal",
            NotificationKind::Announcement => "announcement",
            NotificationKind::General => "general",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "violation" => Ok(NotificationKind::Violation),
            "appeal" => Ok(NotificationKind::Appeal),
            "announcement" => Ok(NotificationKind::Announcement),
            "general" => Ok(NotificationKind::General),
            other => Err(format!("unknown notification kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_uid: Uuid,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Akademik,
    Libur,
    Ujian,
    Kegiatan,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::Akademik => "akademik",
            EventCategory::Libur => "libur",
            EventCategory::Ujian => "ujian",
            EventCategory::Kegiatan => "kegiatan",
        }
    }
}

impl FromStr for EventCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "akademik" => Ok(EventCategory::Akademik),
            "libur" => Ok(EventCategory::Libur),
            "ujian" => Ok(EventCategory::Ujian),
            "kegiatan" => Ok(EventCategory::Kegiatan),
            other => Err(format!("unknown event category '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalendarEvent {
    pub id: Uuid,
    pub title: String,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    pub location: Option<String>,
    pub category: EventCategory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarEventInput {
    pub title: String,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    #[serde(default)]
    pub location: Option<String>,
    pub category: EventCategory,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramSummary {
    pub program: String,
    pub students: usize,
    pub normal: usize,
    pub pembinaan: usize,
    pub terancam_do: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Dosen".parse::<Role>(), Ok(Role::Dosen));
        assert_eq!(" mahasiswa ".parse::<Role>(), Ok(Role::Mahasiswa));
        assert!("kaprodi".parse::<Role>().is_err());
    }

    #[test]
    fn dashboards_live_under_role_prefix() {
        for role in Role::ALL {
            assert!(role.dashboard().starts_with(role.prefix()));
        }
    }

    #[test]
    fn password_hash_is_never_serialized() {
        let account = UserAccount {
            uid: Uuid::new_v4(),
            email: "a@polgan.ac.id".to_string(),
            password_hash: "$2b$12$secret".to_string(),
            role: Role::Admin,
            display_name: "Admin".to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&account).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"role\":\"admin\""));
    }
}
