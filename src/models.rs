use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize::slug;

/// Grade at or above which a module (or a year) is validated.
pub const VALIDATION_THRESHOLD: f64 = 10.0;

/// Enrollment modality of a student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Initial,
    Apprenticeship,
    ContinuingEducation,
    #[default]
    Unknown,
}

impl TrackType {
    /// Reads the modality labels used by the student-information API
    /// ("FI", "FA", "alternance", "Formation continue", ...).
    pub fn from_label(label: &str) -> Self {
        match slug(label).as_str() {
            "fi" | "initiale" | "formation_initiale" | "initial" => TrackType::Initial,
            "fa" | "fap" | "alternance" | "apprentissage" | "apprenticeship" => {
                TrackType::Apprenticeship
            }
            "fc" | "continue" | "formation_continue" | "continuing_education" => {
                TrackType::ContinuingEducation
            }
            _ => TrackType::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleGrade {
    pub module_id: i64,
    pub module_code: String,
    pub module_title: String,
    pub average: Option<f64>,
    pub validated: bool,
    pub semester_label: String,
    /// Semester instance the grade belongs to; tells apart two runs of
    /// the same semester label in different years.
    #[serde(default)]
    pub semester_id: Option<i64>,
}

impl ModuleGrade {
    pub fn new(
        module_id: i64,
        module_code: impl Into<String>,
        module_title: impl Into<String>,
        average: Option<f64>,
        semester_label: impl Into<String>,
    ) -> Self {
        Self {
            module_id,
            module_code: module_code.into(),
            module_title: module_title.into(),
            average,
            validated: average.is_some_and(|g| g >= VALIDATION_THRESHOLD),
            semester_label: semester_label.into(),
            semester_id: None,
        }
    }

    pub fn with_semester_id(mut self, semester_id: Option<i64>) -> Self {
        self.semester_id = semester_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsenceSummary {
    pub student_id: String,
    pub hours_total: f64,
    pub hours_justified: f64,
    pub hours_unjustified: f64,
}

impl AbsenceSummary {
    /// Share of the expected hours missed. Not clamped: a value above 1
    /// means the upstream data is inconsistent.
    pub fn rate(&self, expected_hours: f64) -> f64 {
        if expected_hours <= 0.0 {
            return 0.0;
        }
        self.hours_total / expected_hours
    }
}

/// One student's results for one semester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub student_id: String,
    pub name: String,
    pub first_name: String,
    pub track: Option<String>,
    pub track_type: TrackType,
    pub semester_id: Option<i64>,
    pub semester_label: String,
    pub general_average: Option<f64>,
    pub module_grades: Vec<ModuleGrade>,
    pub absences: Option<AbsenceSummary>,
}

impl StudentRecord {
    /// Numeric part of the semester label ("S3" -> 3), 0 when unreadable.
    pub fn semester_index(&self) -> u32 {
        semester_index(&self.semester_label)
    }

    pub fn failed_modules(&self) -> Vec<String> {
        self.module_grades
            .iter()
            .filter(|m| m.average.is_some() && !m.validated)
            .map(|m| m.module_code.clone())
            .collect()
    }
}

pub fn semester_index(label: &str) -> u32 {
    label
        .trim()
        .trim_start_matches(['S', 's'])
        .parse()
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgrammeModule {
    pub code: String,
    pub title: String,
}

/// Module id -> code/title lookup, fetched from the programme of a semester.
pub type ProgrammeModules = BTreeMap<i64, ProgrammeModule>;

/// A semester instance as listed by the student-information API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemesterRef {
    #[serde(alias = "formsemestre_id")]
    pub id: i64,
    #[serde(alias = "semestre_id", alias = "semestre_idx")]
    pub semester_index: u32,
    #[serde(default, alias = "annee_scolaire")]
    pub year: Option<String>,
    #[serde(default, alias = "titre")]
    pub title: Option<String>,
}

// ---------------------------------------------------------------------------
// Alerts and risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    AcademicDifficulty,
    Attendance,
    DropoutRisk,
    NegativeProgression,
    Other,
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Attention,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlerteEtudiant {
    pub student_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    pub detection_date: DateTime<Utc>,
    pub related_modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRisque {
    pub student_id: String,
    pub global_score: f64,
    pub factors: BTreeMap<String, f64>,
    pub success_probability: f64,
    pub recommendations: Vec<String>,
}

/// Inputs of the alert and risk engine for one student.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StudentMetrics {
    pub student_id: String,
    pub average: Option<f64>,
    pub absenteeism_rate: Option<f64>,
    pub progression_delta: Option<f64>,
    pub track_type: TrackType,
    pub failed_modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentEvaluation {
    pub student_id: String,
    pub alerts: Vec<AlerteEtudiant>,
    pub risk: ScoreRisque,
}

// ---------------------------------------------------------------------------
// Cohort snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DescriptiveStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub q1: f64,
    pub q3: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub label: String,
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CohortStatistics {
    #[serde(rename = "effectif_total")]
    pub student_count: usize,
    pub graded_count: usize,
    pub stats: DescriptiveStats,
    pub success_rate: f64,
    pub difficulty_rate: f64,
    pub excellence_rate: f64,
    pub distribution: Vec<GradeBand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleAnalysis {
    pub module_code: String,
    pub module_title: String,
    pub semesters: Vec<String>,
    pub grade_count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub failure_rate: f64,
    pub alert: bool,
    pub alert_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Absentee {
    pub student_id: String,
    pub hours_total: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AbsenteeismAnalysis {
    pub student_count: usize,
    pub expected_hours_per_student: f64,
    pub hours_total: f64,
    pub hours_justified: f64,
    pub hours_unjustified: f64,
    /// Raw cohort rate, may exceed 1 on inconsistent data.
    pub rate: f64,
    /// `rate` clamped to [0, 1] for display.
    pub display_rate: f64,
    pub inconsistent: bool,
    pub justified_share: f64,
    pub mean_hours_per_student: f64,
    pub students_above_attention: usize,
    pub top_absentees: Vec<Absentee>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackStatistics {
    pub track: String,
    pub statistics: CohortStatistics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearPoint {
    pub year: String,
    pub student_count: usize,
    pub mean: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterannualComparison {
    pub points: Vec<YearPoint>,
    pub mean_delta: f64,
    pub success_rate_delta: f64,
    pub trend: Trend,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_holds_exactly_at_ten() {
        assert!(ModuleGrade::new(1, "R101", "Init dev", Some(10.0), "S1").validated);
        assert!(!ModuleGrade::new(1, "R101", "Init dev", Some(9.99), "S1").validated);
        assert!(!ModuleGrade::new(1, "R101", "Init dev", None, "S1").validated);
    }

    #[test]
    fn severity_is_totally_ordered() {
        assert!(Severity::Critical > Severity::Attention);
        assert!(Severity::Attention > Severity::Info);
    }

    #[test]
    fn track_type_reads_api_labels() {
        assert_eq!(TrackType::from_label("FI"), TrackType::Initial);
        assert_eq!(TrackType::from_label("Alternance"), TrackType::Apprenticeship);
        assert_eq!(
            TrackType::from_label("Formation Continue"),
            TrackType::ContinuingEducation
        );
        assert_eq!(TrackType::from_label("???"), TrackType::Unknown);
    }

    #[test]
    fn semester_index_parses_labels() {
        assert_eq!(semester_index("S3"), 3);
        assert_eq!(semester_index("s10"), 10);
        assert_eq!(semester_index("annual"), 0);
    }

    #[test]
    fn absence_rate_is_not_clamped() {
        let summary = AbsenceSummary {
            student_id: "42".to_string(),
            hours_total: 500.0,
            hours_justified: 100.0,
            hours_unjustified: 400.0,
        };
        assert!((summary.rate(400.0) - 1.25).abs() < 1e-9);
        assert_eq!(summary.rate(0.0), 0.0);
    }

    #[test]
    fn cohort_statistics_serialize_student_count_as_effectif_total() {
        let json = serde_json::to_value(CohortStatistics::default()).unwrap();
        assert_eq!(json["effectif_total"], 0);
    }
}
