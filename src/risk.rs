use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::ConfigAlerte;
use crate::models::{
    AlertType, AlerteEtudiant, ScoreRisque, Severity, StudentEvaluation, StudentMetrics,
    TrackType,
};

/// Weights of the composite dropout-risk score.
///
/// A declared heuristic, not a fitted model. Dashboards compare scores across
/// releases, so changing these changes every published score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskWeights {
    pub grades: f64,
    pub attendance: f64,
    pub progression: f64,
    pub track: f64,
}

pub const RISK_WEIGHTS: RiskWeights = RiskWeights {
    grades: 0.40,
    attendance: 0.30,
    progression: 0.15,
    track: 0.15,
};

/// Absenteeism rate at which the attendance factor saturates.
pub const ATTENDANCE_SATURATION: f64 = 0.30;
/// Average drop (in points) at which the progression factor saturates.
pub const PROGRESSION_SATURATION: f64 = 5.0;

pub const FACTOR_GRADES: &str = "grades";
pub const FACTOR_ATTENDANCE: &str = "attendance";
pub const FACTOR_PROGRESSION: &str = "progression";
pub const FACTOR_TRACK: &str = "track_type";

pub const REC_REMEDIAL: &str = "Organize remedial sessions";
pub const REC_ATTENDANCE: &str = "Contact the student about repeated absences";
pub const REC_PROGRESSION: &str = "Review the student's progression with the teaching team";
pub const REC_TRACK: &str = "Check work or family constraints with the student";
pub const REC_NONE: &str = "Keep regular follow-up";

/// Historical dropout base rate per enrollment modality.
pub fn track_base_rate(track_type: TrackType) -> f64 {
    match track_type {
        TrackType::Initial => 0.30,
        TrackType::Apprenticeship => 0.15,
        TrackType::ContinuingEducation => 0.40,
        TrackType::Unknown => 0.30,
    }
}

/// Which side of a threshold is the bad one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Values strictly below the threshold are worse (grades, progression).
    LowerIsWorse,
    /// Values at or above the threshold are worse (absences, risk).
    HigherIsWorse,
}

/// Two-threshold step function shared by every alert rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdRule {
    pub alert_type: AlertType,
    pub direction: Direction,
    pub attention: f64,
    pub critical: f64,
}

impl ThresholdRule {
    fn breaches(&self, value: f64, threshold: f64) -> bool {
        match self.direction {
            Direction::LowerIsWorse => value < threshold,
            Direction::HigherIsWorse => value >= threshold,
        }
    }

    /// Severity reached by `value`, `None` when it stays on the safe side.
    pub fn severity(&self, value: f64) -> Option<Severity> {
        if self.breaches(value, self.critical) {
            Some(Severity::Critical)
        } else if self.breaches(value, self.attention) {
            Some(Severity::Attention)
        } else {
            None
        }
    }

    fn threshold_for(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Critical => self.critical,
            _ => self.attention,
        }
    }
}

/// The four rules, in evaluation order.
pub fn rules(config: &ConfigAlerte) -> [ThresholdRule; 4] {
    [
        ThresholdRule {
            alert_type: AlertType::AcademicDifficulty,
            direction: Direction::LowerIsWorse,
            attention: config.difficulty_average(),
            critical: config.critical_average(),
        },
        ThresholdRule {
            alert_type: AlertType::Attendance,
            direction: Direction::HigherIsWorse,
            attention: config.attendance_attention_rate(),
            critical: config.attendance_critical_rate(),
        },
        ThresholdRule {
            alert_type: AlertType::NegativeProgression,
            direction: Direction::LowerIsWorse,
            attention: config.progression_delta(),
            critical: config.progression_critical_delta(),
        },
        ThresholdRule {
            alert_type: AlertType::DropoutRisk,
            direction: Direction::HigherIsWorse,
            attention: config.dropout_attention_score(),
            critical: config.dropout_critical_score(),
        },
    ]
}

/// Composite dropout-risk score. Metrics that are missing contribute nothing.
pub fn score_risk(metrics: &StudentMetrics, config: &ConfigAlerte) -> ScoreRisque {
    let weights = RISK_WEIGHTS;
    let mut raw: Vec<(&str, f64, f64)> = Vec::with_capacity(4);

    if let Some(average) = metrics.average {
        raw.push((FACTOR_GRADES, ((20.0 - average) / 20.0).clamp(0.0, 1.0), weights.grades));
    }
    if let Some(rate) = metrics.absenteeism_rate {
        raw.push((
            FACTOR_ATTENDANCE,
            (rate / ATTENDANCE_SATURATION).clamp(0.0, 1.0),
            weights.attendance,
        ));
    }
    if let Some(delta) = metrics.progression_delta {
        let factor = if delta >= 0.0 {
            0.0
        } else {
            (delta.abs() / PROGRESSION_SATURATION).clamp(0.0, 1.0)
        };
        raw.push((FACTOR_PROGRESSION, factor, weights.progression));
    }
    raw.push((FACTOR_TRACK, track_base_rate(metrics.track_type), weights.track));

    let factors: BTreeMap<String, f64> = raw
        .iter()
        .map(|(name, factor, weight)| (name.to_string(), factor * weight))
        .collect();
    let global_score = factors.values().sum::<f64>().clamp(0.0, 1.0);

    ScoreRisque {
        student_id: metrics.student_id.clone(),
        global_score,
        factors,
        success_probability: (1.0 - global_score).clamp(0.0, 1.0),
        recommendations: recommendations(&raw, global_score, config),
    }
}

/// Canned recommendations, highest-priority factor first.
fn recommendations(raw: &[(&str, f64, f64)], global_score: f64, config: &ConfigAlerte) -> Vec<String> {
    const RULES: &[(&str, f64, &str)] = &[
        (FACTOR_GRADES, 0.5, REC_REMEDIAL),
        (FACTOR_ATTENDANCE, 0.5, REC_ATTENDANCE),
        (FACTOR_PROGRESSION, 0.4, REC_PROGRESSION),
        (FACTOR_TRACK, 0.35, REC_TRACK),
    ];

    let mut recs: Vec<String> = RULES
        .iter()
        .filter(|(name, limit, _)| {
            raw.iter()
                .any(|(factor_name, factor, _)| factor_name == name && factor > limit)
        })
        .map(|(_, _, text)| text.to_string())
        .collect();

    if recs.is_empty() && global_score < config.dropout_attention_score() {
        recs.push(REC_NONE.to_string());
    }
    recs
}

fn alert_message(rule: &ThresholdRule, value: f64, threshold: f64) -> String {
    match rule.alert_type {
        AlertType::AcademicDifficulty => {
            format!("General average {value:.2}/20 below {threshold:.2}")
        }
        AlertType::Attendance => format!(
            "Absenteeism {:.1}% at or above {:.1}%",
            value * 100.0,
            threshold * 100.0
        ),
        AlertType::NegativeProgression => {
            format!("Average dropped by {:.2} points since last semester", value.abs())
        }
        AlertType::DropoutRisk => {
            format!("Dropout risk score {value:.2} at or above {threshold:.2}")
        }
        AlertType::Other => format!("Value {value:.2} out of expected range"),
    }
}

/// Evaluates one student against `config` at a given instant.
///
/// Rules run in a fixed order (difficulty, attendance, progression, dropout
/// risk); a rule whose metric is missing is skipped. The returned alerts are
/// ranked by severity, ties keeping evaluation order.
pub fn evaluate_at(
    metrics: &StudentMetrics,
    config: &ConfigAlerte,
    now: DateTime<Utc>,
) -> (Vec<AlerteEtudiant>, ScoreRisque) {
    let score = score_risk(metrics, config);
    let [difficulty, attendance, progression, dropout] = rules(config);
    let checks = [
        (difficulty, metrics.average),
        (attendance, metrics.absenteeism_rate),
        (progression, metrics.progression_delta),
        (dropout, Some(score.global_score)),
    ];

    let mut alerts = Vec::new();
    for (rule, value) in checks {
        let Some(value) = value else {
            continue;
        };
        let Some(severity) = rule.severity(value) else {
            continue;
        };
        let threshold = rule.threshold_for(severity);
        let related_modules = match rule.alert_type {
            AlertType::AcademicDifficulty | AlertType::DropoutRisk => metrics.failed_modules.clone(),
            _ => Vec::new(),
        };
        alerts.push(AlerteEtudiant {
            student_id: metrics.student_id.clone(),
            alert_type: rule.alert_type,
            severity,
            message: alert_message(&rule, value, threshold),
            current_value: value,
            threshold,
            detection_date: now,
            related_modules,
        });
    }

    if let Some(rate) = metrics.absenteeism_rate.filter(|rate| *rate > 1.0) {
        alerts.push(AlerteEtudiant {
            student_id: metrics.student_id.clone(),
            alert_type: AlertType::Other,
            severity: Severity::Info,
            message: format!(
                "Absence hours exceed expected hours ({:.0}%), check the source data",
                rate * 100.0
            ),
            current_value: rate,
            threshold: 1.0,
            detection_date: now,
            related_modules: Vec::new(),
        });
    }

    alerts.sort_by(|a, b| b.severity.cmp(&a.severity));
    (alerts, score)
}

pub fn evaluate(metrics: &StudentMetrics, config: &ConfigAlerte) -> (Vec<AlerteEtudiant>, ScoreRisque) {
    evaluate_at(metrics, config, Utc::now())
}

/// Evaluates every student, riskiest first.
pub fn evaluate_cohort(metrics: &[StudentMetrics], config: &ConfigAlerte) -> Vec<StudentEvaluation> {
    let now = Utc::now();
    let mut evaluations: Vec<StudentEvaluation> = metrics
        .iter()
        .map(|m| {
            let (alerts, risk) = evaluate_at(m, config, now);
            StudentEvaluation {
                student_id: m.student_id.clone(),
                alerts,
                risk,
            }
        })
        .collect();
    evaluations.sort_by(|a, b| b.risk.global_score.total_cmp(&a.risk.global_score));
    evaluations
}
