use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{ProgramSummary, Student};

pub const DEFAULT_PEMBINAAN: i32 = 50;
pub const DEFAULT_TERANCAM_DO: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentStatus {
    Normal,
    Pembinaan,
    TerancamDo,
}

impl StudentStatus {
    /// Key stored in the `students.status` column.
    pub fn as_key(self) -> &'static str {
        match self {
            StudentStatus::Normal => "normal",
            StudentStatus::Pembinaan => "pembinaan",
            StudentStatus::TerancamDo => "terancam_do",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StudentStatus::Normal => "Normal",
            StudentStatus::Pembinaan => "Pembinaan",
            StudentStatus::TerancamDo => "Terancam DO",
        }
    }
}

impl fmt::Display for StudentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StudentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "normal" | "Normal" => Ok(StudentStatus::Normal),
            "pembinaan" | "Pembinaan" => Ok(StudentStatus::Pembinaan),
            "terancam_do" | "Terancam DO" => Ok(StudentStatus::TerancamDo),
            other => Err(format!("unknown student status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub pembinaan: i32,
    pub terancam_do: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pembinaan: DEFAULT_PEMBINAAN,
            terancam_do: DEFAULT_TERANCAM_DO,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), String> {
        if self.pembinaan <= 0 || self.terancam_do <= 0 {
            return Err("thresholds must be positive".to_string());
        }
        if self.pembinaan >= self.terancam_do {
            return Err("pembinaan threshold must be below terancam DO threshold".to_string());
        }
        Ok(())
    }
}

pub fn status_for(points: i32, thresholds: &Thresholds) -> StudentStatus {
    if points >= thresholds.terancam_do {
        StudentStatus::TerancamDo
    } else if points >= thresholds.pembinaan {
        StudentStatus::Pembinaan
    } else {
        StudentStatus::Normal
    }
}

pub fn points_to_next_tier(points: i32, thresholds: &Thresholds) -> Option<i32> {
    match status_for(points, thresholds) {
        StudentStatus::Normal => Some(thresholds.pembinaan - points),
        StudentStatus::Pembinaan => Some(thresholds.terancam_do - points),
        StudentStatus::TerancamDo => None,
    }
}

pub fn summarize_by_program(students: &[Student]) -> Vec<ProgramSummary> {
    let mut map: BTreeMap<&str, ProgramSummary> = BTreeMap::new();

    for student in students {
        let entry = map
            .entry(student.program.as_str())
            .or_insert_with(|| ProgramSummary {
                program: student.program.clone(),
                students: 0,
                normal: 0,
                pembinaan: 0,
                terancam_do: 0,
            });
        entry.students += 1;
        match student.status {
            StudentStatus::Normal => entry.normal += 1,
            StudentStatus::Pembinaan => entry.pembinaan += 1,
            StudentStatus::TerancamDo => entry.terancam_do += 1,
        }
    }

    map.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn student(program: &str, status: StudentStatus) -> Student {
        Student {
            id: Uuid::new_v4(),
            uid: None,
            nim: "2201001".to_string(),
            name: "Rina Siregar".to_string(),
            email: "rina@polgan.ac.id".to_string(),
            program: program.to_string(),
            points: 0,
            status,
            photo_url: None,
        }
    }

    #[test]
    fn status_follows_threshold_boundaries() {
        let thresholds = Thresholds {
            pembinaan: 50,
            terancam_do: 100,
        };
        assert_eq!(status_for(0, &thresholds), StudentStatus::Normal);
        assert_eq!(status_for(49, &thresholds), StudentStatus::Normal);
        assert_eq!(status_for(50, &thresholds), StudentStatus::Pembinaan);
        assert_eq!(status_for(99, &thresholds), StudentStatus::Pembinaan);
        assert_eq!(status_for(100, &thresholds), StudentStatus::TerancamDo);
        assert_eq!(status_for(250, &thresholds), StudentStatus::TerancamDo);
    }

    #[test]
    fn status_is_monotonic_in_points() {
        let thresholds = Thresholds::default();
        let mut previous = StudentStatus::Normal;
        for points in 0..=200 {
            let current = status_for(points, &thresholds);
            assert!(current >= previous, "status regressed at {points}");
            previous = current;
        }
    }

    #[test]
    fn next_tier_distance() {
        let thresholds = Thresholds::default();
        assert_eq!(points_to_next_tier(30, &thresholds), Some(20));
        assert_eq!(points_to_next_tier(60, &thresholds), Some(40));
        assert_eq!(points_to_next_tier(100, &thresholds), None);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let thresholds = Thresholds {
            pembinaan: 80,
            terancam_do: 80,
        };
        assert!(thresholds.validate().is_err());
        assert!(Thresholds::default().validate().is_ok());
    }

    #[test]
    fn status_keys_round_trip_through_labels() {
        assert_eq!("Terancam DO".parse::<StudentStatus>(), Ok(StudentStatus::TerancamDo));
        assert_eq!(StudentStatus::TerancamDo.as_key(), "terancam_do");
    }

    #[test]
    fn programs_are_summarized_per_tier() {
        let students = vec![
            student("Manajemen Informatika", StudentStatus::Normal),
            student("Manajemen Informatika", StudentStatus::TerancamDo),
            student("Akuntansi", StudentStatus::Pembinaan),
        ];
        let summaries = summarize_by_program(&students);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].program, "Akuntansi");
        assert_eq!(summaries[0].pembinaan, 1);
        assert_eq!(summaries[1].students, 2);
        assert_eq!(summaries[1].normal, 1);
        assert_eq!(summaries[1].terancam_do, 1);
    }
}
