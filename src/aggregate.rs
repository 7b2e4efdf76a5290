//! Cohort-level aggregation of normalized student records.
//!
//! Every function here is pure: it takes a snapshot of records and returns a
//! fresh indicator object. An empty snapshot gives a zero-valued object, never
//! an error.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use tracing::debug;

use crate::models::{
    AbsenceSummary, Absentee, AbsenteeismAnalysis, CohortStatistics, GradeBand,
    InterannualComparison, ModuleAnalysis, StudentMetrics, StudentRecord, TrackStatistics,
    Trend, YearPoint, VALIDATION_THRESHOLD,
};
use crate::stats::{self, describe, ratio, round2};

/// Averages strictly below this are "in difficulty".
pub const DIFFICULTY_THRESHOLD: f64 = 8.0;
/// Averages at or above this are "excellent".
pub const EXCELLENCE_THRESHOLD: f64 = 14.0;
/// Modules failed by more than this share of students are flagged.
pub const MODULE_FAILURE_RATE_ALERT: f64 = 0.25;
/// Modules whose grades spread more than this are flagged.
pub const MODULE_STD_DEV_ALERT: f64 = 4.0;
/// Individual absence rate counted in `students_above_attention`.
pub const ABSENCE_ATTENTION_RATE: f64 = 0.10;
/// Mean change (in points) below which two years count as stable.
pub const TREND_STABILITY_BAND: f64 = 0.5;

const TOP_ABSENTEES: usize = 10;
const UNSPECIFIED_TRACK: &str = "unspecified";

const GRADE_BANDS: &[(&str, f64, f64)] = &[
    ("0-4", 0.0, 4.0),
    ("4-8", 4.0, 8.0),
    ("8-10", 8.0, 10.0),
    ("10-12", 10.0, 12.0),
    ("12-14", 12.0, 14.0),
    ("14-16", 14.0, 16.0),
    ("16-20", 16.0, 20.0),
];

/// One record per student: the one from the highest semester, first on ties.
/// Output is ordered by student id.
pub fn latest_per_student(records: &[StudentRecord]) -> Vec<&StudentRecord> {
    let mut latest: BTreeMap<&str, &StudentRecord> = BTreeMap::new();
    for record in records {
        latest
            .entry(record.student_id.as_str())
            .and_modify(|current| {
                if record.semester_index() > current.semester_index() {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    latest.into_values().collect()
}

pub fn aggregate(records: &[StudentRecord]) -> CohortStatistics {
    let students = latest_per_student(records);
    let averages: Vec<f64> = students.iter().filter_map(|r| r.general_average).collect();

    CohortStatistics {
        student_count: students.len(),
        graded_count: averages.len(),
        stats: describe(&averages),
        success_rate: ratio(&averages, |g| g >= VALIDATION_THRESHOLD),
        difficulty_rate: ratio(&averages, |g| g < DIFFICULTY_THRESHOLD),
        excellence_rate: ratio(&averages, |g| g >= EXCELLENCE_THRESHOLD),
        distribution: grade_distribution(&averages),
    }
}

/// Counts grades per band; the last band includes 20.
pub fn grade_distribution(grades: &[f64]) -> Vec<GradeBand> {
    GRADE_BANDS
        .iter()
        .enumerate()
        .map(|(i, (label, lower, upper))| {
            let last = i == GRADE_BANDS.len() - 1;
            let count = grades
                .iter()
                .filter(|g| **g >= *lower && (**g < *upper || (last && **g <= *upper)))
                .count();
            GradeBand {
                label: label.to_string(),
                lower: *lower,
                upper: *upper,
                count,
            }
        })
        .collect()
}

/// Cohort statistics per track, ordered by track label.
pub fn track_breakdown(records: &[StudentRecord]) -> Vec<TrackStatistics> {
    let mut by_track: BTreeMap<String, Vec<StudentRecord>> = BTreeMap::new();
    for record in latest_per_student(records) {
        let track = record
            .track
            .clone()
            .unwrap_or_else(|| UNSPECIFIED_TRACK.to_string());
        by_track.entry(track).or_default().push(record.clone());
    }
    by_track
        .into_iter()
        .map(|(track, records)| TrackStatistics {
            track,
            statistics: aggregate(&records),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Module analysis
// ---------------------------------------------------------------------------

/// Orderings offered for module analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleSort {
    /// Highest failure rate first.
    #[default]
    FailureRate,
    /// Lowest mean first.
    Mean,
    /// Widest spread first.
    StdDev,
    /// Alphabetical by module code.
    Code,
}

impl ModuleSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleSort::FailureRate => "failure-rate",
            ModuleSort::Mean => "mean",
            ModuleSort::StdDev => "std-dev",
            ModuleSort::Code => "code",
        }
    }
}

impl FromStr for ModuleSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failure-rate" | "taux_echec" => Ok(ModuleSort::FailureRate),
            "mean" | "moyenne" => Ok(ModuleSort::Mean),
            "std-dev" | "ecart_type" => Ok(ModuleSort::StdDev),
            "code" => Ok(ModuleSort::Code),
            other => Err(format!(
                "unknown module sort '{other}' (expected failure-rate, mean, std-dev or code)"
            )),
        }
    }
}

pub fn module_analysis(records: &[StudentRecord], sort: ModuleSort) -> Vec<ModuleAnalysis> {
    // Re-enrollments share a code across semesters: collect per
    // (semester instance, module id) first, regroup by code only for display.
    type InstanceKey = (Option<i64>, String, i64);
    let mut by_instance: BTreeMap<InstanceKey, (String, String, Vec<f64>)> = BTreeMap::new();
    for record in records {
        for grade in &record.module_grades {
            let Some(average) = grade.average else {
                continue;
            };
            by_instance
                .entry((grade.semester_id, grade.semester_label.clone(), grade.module_id))
                .or_insert_with(|| {
                    (grade.module_code.clone(), grade.module_title.clone(), Vec::new())
                })
                .2
                .push(average);
        }
    }

    let mut by_code: BTreeMap<String, (String, BTreeSet<String>, Vec<f64>)> = BTreeMap::new();
    for ((_, semester, _), (code, title, grades)) in by_instance {
        let entry = by_code
            .entry(code)
            .or_insert_with(|| (title.clone(), BTreeSet::new(), Vec::new()));
        if entry.0.is_empty() {
            entry.0 = title;
        }
        entry.1.insert(semester);
        entry.2.extend(grades);
    }

    let mut analyses: Vec<ModuleAnalysis> = by_code
        .into_iter()
        .map(|(code, (title, semesters, grades))| analyze_module(code, title, semesters, &grades))
        .collect();
    sort_modules(&mut analyses, sort);
    analyses
}

fn analyze_module(
    module_code: String,
    module_title: String,
    semesters: BTreeSet<String>,
    grades: &[f64],
) -> ModuleAnalysis {
    let summary = describe(grades);
    let failure_rate = ratio(grades, |g| g < VALIDATION_THRESHOLD);
    let spread = stats::std_dev(grades);

    let mut reasons = Vec::new();
    if failure_rate > MODULE_FAILURE_RATE_ALERT {
        reasons.push(format!("failure rate {:.0}%", failure_rate * 100.0));
    }
    if spread > MODULE_STD_DEV_ALERT {
        reasons.push(format!("high grade spread (std dev {spread:.2})"));
    }

    ModuleAnalysis {
        module_code,
        module_title,
        semesters: semesters.into_iter().collect(),
        grade_count: summary.count,
        mean: summary.mean,
        median: summary.median,
        std_dev: summary.std_dev,
        min: summary.min,
        max: summary.max,
        failure_rate,
        alert: !reasons.is_empty(),
        alert_message: (!reasons.is_empty()).then(|| reasons.join("; ")),
    }
}

pub fn sort_modules(analyses: &mut [ModuleAnalysis], sort: ModuleSort) {
    match sort {
        ModuleSort::FailureRate => {
            analyses.sort_by(|a, b| b.failure_rate.total_cmp(&a.failure_rate))
        }
        ModuleSort::Mean => analyses.sort_by(|a, b| a.mean.total_cmp(&b.mean)),
        ModuleSort::StdDev => analyses.sort_by(|a, b| b.std_dev.total_cmp(&a.std_dev)),
        ModuleSort::Code => analyses.sort_by(|a, b| a.module_code.cmp(&b.module_code)),
    }
}

// ---------------------------------------------------------------------------
// Absenteeism
// ---------------------------------------------------------------------------

/// Absence summaries carried inside the results payload itself.
pub fn absences_from_records(records: &[StudentRecord]) -> Vec<AbsenceSummary> {
    records.iter().filter_map(|r| r.absences.clone()).collect()
}

/// A student's absence hours over every semester summary they appear in.
#[derive(Debug, Clone)]
struct StudentAbsences {
    totals: AbsenceSummary,
    /// Number of semester summaries summed into `totals`.
    semesters: u32,
}

impl StudentAbsences {
    fn expected_hours(&self, expected_hours_per_student: f64) -> f64 {
        f64::from(self.semesters.max(1)) * expected_hours_per_student
    }

    fn rate(&self, expected_hours_per_student: f64) -> f64 {
        self.totals
            .rate(self.expected_hours(expected_hours_per_student))
    }
}

/// Hours per student, restricted to the students present in `records`.
/// Each summary covers one semester.
fn hours_by_student(
    records: &[StudentRecord],
    absences: &[AbsenceSummary],
) -> BTreeMap<String, StudentAbsences> {
    let cohort: BTreeSet<&str> = records.iter().map(|r| r.student_id.as_str()).collect();
    let mut totals: BTreeMap<String, StudentAbsences> = BTreeMap::new();
    for absence in absences {
        if !cohort.contains(absence.student_id.as_str()) {
            debug!(student_id = %absence.student_id, "absence for a student outside the cohort");
            continue;
        }
        let entry = totals
            .entry(absence.student_id.clone())
            .or_insert_with(|| StudentAbsences {
                totals: AbsenceSummary {
                    student_id: absence.student_id.clone(),
                    hours_total: 0.0,
                    hours_justified: 0.0,
                    hours_unjustified: 0.0,
                },
                semesters: 0,
            });
        entry.totals.hours_total += absence.hours_total;
        entry.totals.hours_justified += absence.hours_justified;
        entry.totals.hours_unjustified += absence.hours_unjustified;
        entry.semesters += 1;
    }
    totals
}

/// Absenteeism of the cohort. Expected hours scale with the number of
/// semesters each student's absences cover, so a scope spanning several
/// semesters keeps per-semester rates.
pub fn absenteeism_analysis(
    records: &[StudentRecord],
    absences: &[AbsenceSummary],
    expected_hours_per_student: f64,
) -> AbsenteeismAnalysis {
    let student_count = latest_per_student(records).len();
    let per_student = hours_by_student(records, absences);

    let hours_total: f64 = per_student.values().map(|a| a.totals.hours_total).sum();
    let hours_justified: f64 = per_student.values().map(|a| a.totals.hours_justified).sum();
    let hours_unjustified: f64 = per_student.values().map(|a| a.totals.hours_unjustified).sum();

    // Students without any summary count for one semester.
    let unrecorded = student_count.saturating_sub(per_student.len());
    let expected_total = per_student
        .values()
        .map(|a| a.expected_hours(expected_hours_per_student))
        .sum::<f64>()
        + unrecorded as f64 * expected_hours_per_student;
    let rate = if expected_total > 0.0 {
        hours_total / expected_total
    } else {
        0.0
    };

    let mut absentees: Vec<Absentee> = per_student
        .values()
        .map(|a| Absentee {
            student_id: a.totals.student_id.clone(),
            hours_total: a.totals.hours_total,
            rate: a.rate(expected_hours_per_student),
        })
        .collect();
    absentees.sort_by(|a, b| b.hours_total.total_cmp(&a.hours_total));
    let students_above_attention = absentees
        .iter()
        .filter(|a| a.rate >= ABSENCE_ATTENTION_RATE)
        .count();
    absentees.truncate(TOP_ABSENTEES);

    AbsenteeismAnalysis {
        student_count,
        expected_hours_per_student,
        hours_total,
        hours_justified,
        hours_unjustified,
        rate,
        display_rate: rate.clamp(0.0, 1.0),
        inconsistent: rate > 1.0,
        justified_share: if hours_total > 0.0 {
            hours_justified / hours_total
        } else {
            0.0
        },
        mean_hours_per_student: if student_count > 0 {
            round2(hours_total / student_count as f64)
        } else {
            0.0
        },
        students_above_attention,
        top_absentees: absentees,
    }
}

// ---------------------------------------------------------------------------
// Interannual comparison and per-student metrics
// ---------------------------------------------------------------------------

/// Compares cohort snapshots of several academic years, oldest first.
pub fn interannual_comparison(years: &[(String, CohortStatistics)]) -> InterannualComparison {
    let mut points: Vec<YearPoint> = years
        .iter()
        .map(|(year, statistics)| YearPoint {
            year: year.clone(),
            student_count: statistics.student_count,
            mean: statistics.stats.mean,
            success_rate: statistics.success_rate,
        })
        .collect();
    points.sort_by(|a, b| a.year.cmp(&b.year));

    let (mean_delta, success_rate_delta) = match (points.first(), points.last()) {
        (Some(first), Some(last)) if points.len() > 1 => (
            round2(last.mean - first.mean),
            last.success_rate - first.success_rate,
        ),
        _ => (0.0, 0.0),
    };
    let trend = if mean_delta > TREND_STABILITY_BAND {
        Trend::Up
    } else if mean_delta < -TREND_STABILITY_BAND {
        Trend::Down
    } else {
        Trend::Stable
    };

    InterannualComparison {
        points,
        mean_delta,
        success_rate_delta,
        trend,
    }
}

/// Change of general average between a student's two most recent graded
/// semesters. Students graded in a single semester are absent from the map.
pub fn progression_deltas(records: &[StudentRecord]) -> BTreeMap<String, f64> {
    let mut history: HashMap<&str, Vec<(u32, f64)>> = HashMap::new();
    for record in records {
        if let Some(average) = record.general_average {
            history
                .entry(record.student_id.as_str())
                .or_default()
                .push((record.semester_index(), average));
        }
    }

    history
        .into_iter()
        .filter_map(|(student_id, mut graded)| {
            graded.sort_by_key(|(index, _)| *index);
            let [.., (_, previous), (_, latest)] = graded.as_slice() else {
                return None;
            };
            Some((student_id.to_string(), round2(latest - previous)))
        })
        .collect()
}

/// Builds the alert engine inputs for each student of the snapshot.
pub fn student_metrics(
    records: &[StudentRecord],
    absences: &[AbsenceSummary],
    expected_hours_per_student: f64,
) -> Vec<StudentMetrics> {
    let deltas = progression_deltas(records);
    let hours = hours_by_student(records, absences);

    latest_per_student(records)
        .into_iter()
        .map(|record| StudentMetrics {
            student_id: record.student_id.clone(),
            average: record.general_average,
            absenteeism_rate: hours
                .get(&record.student_id)
                .map(|a| a.rate(expected_hours_per_student)),
            progression_delta: deltas.get(&record.student_id).copied(),
            track_type: record.track_type,
            failed_modules: record.failed_modules(),
        })
        .collect()
}
