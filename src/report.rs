use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::{Student, Violation};
use crate::status::{summarize_by_program, Thresholds};

pub fn build_report(
    program: Option<&str>,
    since: NaiveDate,
    thresholds: &Thresholds,
    students: &[Student],
    violations: &[Violation],
) -> String {
    let summaries = summarize_by_program(students);

    let mut output = String::new();
    let program_label = program.unwrap_or("semua program studi");

    let _ = writeln!(output, "# Laporan Kedisiplinan Mahasiswa");
    let _ = writeln!(
        output,
        "Politeknik Ganesha Medan, {} (pelanggaran sejak {})",
        program_label, since
    );
    let _ = writeln!(
        output,
        "Ambang batas: Pembinaan >= {} poin, Terancam DO >= {} poin",
        thresholds.pembinaan, thresholds.terancam_do
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Status per Program Studi");

    if summaries.is_empty() {
        let _ = writeln!(output, "Belum ada mahasiswa terdaftar.");
    } else {
        for summary in &summaries {
            let _ = writeln!(
                output,
                "- {}: {} mahasiswa (Normal {}, Pembinaan {}, Terancam DO {})",
                summary.program,
                summary.students,
                summary.normal,
                summary.pembinaan,
                summary.terancam_do
            );
        }
    }

    let mut ranked: Vec<&Student> = students.iter().filter(|s| s.points > 0).collect();
    ranked.sort_by(|a, b| b.points.cmp(&a.points).then_with(|| a.name.cmp(&b.name)));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Poin Tertinggi");

    if ranked.is_empty() {
        let _ = writeln!(output, "Tidak ada mahasiswa dengan poin pelanggaran.");
    } else {
        for student in ranked.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}, {}) {} poin, status {}",
                student.name, student.nim, student.program, student.points, student.status
            );
        }
    }

    let mut recent: Vec<&Violation> = violations.iter().filter(|v| v.occurred_on >= since).collect();
    recent.sort_by(|a, b| b.occurred_on.cmp(&a.occurred_on));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Pelanggaran Terbaru");

    if recent.is_empty() {
        let _ = writeln!(output, "Tidak ada pelanggaran pada periode ini.");
    } else {
        for violation in recent.iter().take(10) {
            let voided = if violation.voided { " (dibatalkan)" } else { "" };
            let _ = writeln!(
                output,
                "- {} pada {}: {} ({} poin){}",
                violation.student_name,
                violation.occurred_on,
                violation.rule_name,
                violation.points,
                voided
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StudentStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn student(name: &str, points: i32, status: StudentStatus) -> Student {
        Student {
            id: Uuid::new_v4(),
            uid: None,
            nim: "2301010001".to_string(),
            name: name.to_string(),
            email: format!("{}@polgan.ac.id", name.to_lowercase()),
            program: "Manajemen Informatika".to_string(),
            points,
            status,
            photo_url: None,
        }
    }

    fn violation(name: &str, day: u32, voided: bool) -> Violation {
        Violation {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            student_name: name.to_string(),
            rule_id: Uuid::new_v4(),
            rule_name: "Merokok di area kampus".to_string(),
            occurred_on: NaiveDate::from_ymd_opt(2026, 9, day).unwrap(),
            points: 15,
            evidence_urls: Vec::new(),
            note: String::new(),
            reported_by: None,
            voided,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn report_lists_tiers_and_ranking() {
        let students = vec![
            student("Dimas", 60, StudentStatus::Pembinaan),
            student("Siti", 0, StudentStatus::Normal),
            student("Yohanes", 110, StudentStatus::TerancamDo),
        ];
        let since = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        let report = build_report(None, since, &Thresholds::default(), &students, &[]);

        assert!(report.contains("Manajemen Informatika: 3 mahasiswa (Normal 1, Pembinaan 1, Terancam DO 1)"));
        let yohanes = report.find("Yohanes").unwrap();
        let dimas = report.find("Dimas").unwrap();
        assert!(yohanes < dimas);
        assert!(!report.contains("- Siti"));
        assert!(report.contains("Tidak ada pelanggaran pada periode ini."));
    }

    #[test]
    fn report_marks_voided_violations_and_respects_window() {
        let since = NaiveDate::from_ymd_opt(2026, 9, 10).unwrap();
        let violations = vec![violation("Dimas", 12, true), violation("Siti", 2, false)];
        let report = build_report(Some("Akuntansi"), since, &Thresholds::default(), &[], &violations);

        assert!(report.contains("Akuntansi"));
        assert!(report.contains("Dimas pada 2026-09-12: Merokok di area kampus (15 poin) (dibatalkan)"));
        assert!(!report.contains("Siti pada"));
    }
}
