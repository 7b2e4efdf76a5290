use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;
use serde::Serialize;

use crate::indicators::Scope;
use crate::models::{
    AbsenteeismAnalysis, AlertType, CohortStatistics, ModuleAnalysis, Severity, StudentEvaluation,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertTypeSummary {
    pub alert_type: AlertType,
    pub count: usize,
    pub critical: usize,
}

/// Everything a dashboard report is rendered from.
#[derive(Debug, Clone)]
pub struct ReportInput<'a> {
    pub scope: &'a Scope,
    pub generated_on: NaiveDate,
    pub statistics: &'a CohortStatistics,
    pub modules: &'a [ModuleAnalysis],
    pub absenteeism: &'a AbsenteeismAnalysis,
    pub evaluations: &'a [StudentEvaluation],
}

pub fn alert_type_label(alert_type: AlertType) -> &'static str {
    match alert_type {
        AlertType::AcademicDifficulty => "academic difficulty",
        AlertType::Attendance => "attendance",
        AlertType::DropoutRisk => "dropout risk",
        AlertType::NegativeProgression => "negative progression",
        AlertType::Other => "other",
    }
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "info",
        Severity::Attention => "attention",
        Severity::Critical => "critical",
    }
}

pub fn summarize_alerts(evaluations: &[StudentEvaluation]) -> Vec<AlertTypeSummary> {
    let mut map: BTreeMap<&'static str, AlertTypeSummary> = BTreeMap::new();

    for alert in evaluations.iter().flat_map(|e| &e.alerts) {
        let entry = map
            .entry(alert_type_label(alert.alert_type))
            .or_insert(AlertTypeSummary {
                alert_type: alert.alert_type,
                count: 0,
                critical: 0,
            });
        entry.count += 1;
        if alert.severity == Severity::Critical {
            entry.critical += 1;
        }
    }

    let mut summaries: Vec<AlertTypeSummary> = map.into_values().collect();
    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    summaries
}

fn percent(rate: f64) -> f64 {
    rate * 100.0
}

pub fn build_report(input: &ReportInput<'_>) -> String {
    let scope = input.scope;
    let stats = input.statistics;
    let mut output = String::new();

    let mut scope_label = format!("{} {}", scope.department, scope.year);
    if let Some(semester) = scope.semester {
        let _ = write!(scope_label, ", S{semester}");
    }
    if let Some(track) = &scope.track {
        let _ = write!(scope_label, ", track {track}");
    }
    if let Some(modality) = &scope.modality {
        let _ = write!(scope_label, ", {modality}");
    }

    let _ = writeln!(output, "# Cohort Indicators Report");
    let _ = writeln!(
        output,
        "Generated for {} on {}",
        scope_label, input.generated_on
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Cohort");

    if stats.graded_count == 0 {
        let _ = writeln!(
            output,
            "{} students, no graded results yet.",
            stats.student_count
        );
    } else {
        let _ = writeln!(
            output,
            "- {} students ({} graded)",
            stats.student_count, stats.graded_count
        );
        let _ = writeln!(
            output,
            "- Mean {:.2}, median {:.2}, std dev {:.2} (range {:.2} to {:.2})",
            stats.stats.mean, stats.stats.median, stats.stats.std_dev, stats.stats.min, stats.stats.max
        );
        let _ = writeln!(
            output,
            "- Success {:.1}%, difficulty {:.1}%, excellence {:.1}%",
            percent(stats.success_rate),
            percent(stats.difficulty_rate),
            percent(stats.excellence_rate)
        );
        for band in stats.distribution.iter().filter(|b| b.count > 0) {
            let _ = writeln!(output, "  - {}: {}", band.label, band.count);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Modules Needing Attention");

    let flagged: Vec<&ModuleAnalysis> = input.modules.iter().filter(|m| m.alert).collect();
    if flagged.is_empty() {
        let _ = writeln!(output, "No module above the alert thresholds.");
    } else {
        for module in flagged {
            let _ = writeln!(
                output,
                "- {} {}: mean {:.2}, failure {:.1}%{}",
                module.module_code,
                module.module_title,
                module.mean,
                percent(module.failure_rate),
                module
                    .alert_message
                    .as_deref()
                    .map(|m| format!(" ({m})"))
                    .unwrap_or_default()
            );
        }
    }

    let absences = input.absenteeism;
    let _ = writeln!(output);
    let _ = writeln!(output, "## Absenteeism");

    if absences.student_count == 0 {
        let _ = writeln!(output, "No absence data for this cohort.");
    } else {
        let _ = writeln!(
            output,
            "- Rate {:.1}% ({:.1} h total, {:.1}% justified)",
            percent(absences.display_rate),
            absences.hours_total,
            percent(absences.justified_share)
        );
        if absences.inconsistent {
            let _ = writeln!(
                output,
                "- Recorded hours exceed the expected volume, check the source data"
            );
        }
        let _ = writeln!(
            output,
            "- {} students above the attention rate",
            absences.students_above_attention
        );
        for absentee in absences.top_absentees.iter().take(5) {
            let _ = writeln!(
                output,
                "  - {}: {:.1} h ({:.1}%)",
                absentee.student_id,
                absentee.hours_total,
                percent(absentee.rate)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Alerts");

    let summaries = summarize_alerts(input.evaluations);
    if summaries.is_empty() {
        let _ = writeln!(output, "No alerts raised.");
    } else {
        for summary in &summaries {
            let _ = writeln!(
                output,
                "- {}: {} alerts ({} critical)",
                alert_type_label(summary.alert_type),
                summary.count,
                summary.critical
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Students");

    let at_risk: Vec<&StudentEvaluation> = input
        .evaluations
        .iter()
        .filter(|e| !e.alerts.is_empty())
        .take(10)
        .collect();
    if at_risk.is_empty() {
        let _ = writeln!(output, "No student flagged.");
    } else {
        for evaluation in at_risk {
            let worst = evaluation
                .alerts
                .first()
                .map(|a| severity_label(a.severity))
                .unwrap_or("info");
            let _ = writeln!(
                output,
                "- {} score {:.2} ({} alerts, worst {}), success {:.0}%",
                evaluation.student_id,
                evaluation.risk.global_score,
                evaluation.alerts.len(),
                worst,
                percent(evaluation.risk.success_probability)
            );
            for recommendation in &evaluation.risk.recommendations {
                let _ = writeln!(output, "  - {recommendation}");
            }
        }
    }

    output
}
