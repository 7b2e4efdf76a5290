//! Indicator entry points.
//!
//! Each method resolves the semesters of a [`Scope`], normalizes their raw
//! results, computes one indicator and memoizes it through the
//! [`IndicatorCache`]. Outputs are plain serializable data.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::aggregate::{self, ModuleSort};
use crate::cache::{CacheKey, IndicatorCache, IndicatorKind, TtlTier};
use crate::config::AnalyticsConfig;
use crate::models::{
    AbsenceSummary, AbsenteeismAnalysis, CohortStatistics, InterannualComparison,
    ModuleAnalysis, SemesterRef, StudentEvaluation, StudentMetrics, StudentRecord, TrackStatistics,
    TrackType,
};
use crate::normalize::{normalize_semester, slug};
use crate::risk;
use crate::source::AcademicSource;
use crate::Result;

/// Department, academic year and optional filters an indicator covers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scope {
    pub department: String,
    pub year: String,
    pub semester: Option<u32>,
    pub track: Option<String>,
    pub modality: Option<String>,
}

impl Scope {
    pub fn new(department: impl Into<String>, year: impl Into<String>) -> Self {
        Self {
            department: department.into(),
            year: year.into(),
            ..Self::default()
        }
    }

    pub fn with_semester(mut self, semester: Option<u32>) -> Self {
        self.semester = semester;
        self
    }

    pub fn with_track(mut self, track: Option<String>) -> Self {
        self.track = track;
        self
    }

    pub fn with_modality(mut self, modality: Option<String>) -> Self {
        self.modality = modality;
        self
    }

    pub fn for_year(&self, year: &str) -> Self {
        Self {
            year: year.to_string(),
            ..self.clone()
        }
    }

    pub fn cache_key(&self, kind: IndicatorKind) -> CacheKey {
        CacheKey::new(kind, &self.department, &self.year, self.semester)
            .with_filter("track", self.track.as_deref())
            .with_filter("modality", self.modality.as_deref())
    }

    /// Whether a record passes the track and modality filters.
    pub fn matches(&self, record: &StudentRecord) -> bool {
        let track_ok = match &self.track {
            Some(track) => record.track.as_deref().map(slug) == Some(slug(track)),
            None => true,
        };
        let modality_ok = match &self.modality {
            Some(modality) => TrackType::from_label(modality) == record.track_type,
            None => true,
        };
        track_ok && modality_ok
    }
}

/// Normalized records and absences of a scope, at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub records: Vec<StudentRecord>,
    pub absences: Vec<AbsenceSummary>,
}

pub struct IndicatorService<S> {
    source: S,
    cache: IndicatorCache,
    config: AnalyticsConfig,
}

impl<S: AcademicSource> IndicatorService<S> {
    pub fn new(source: S, cache: IndicatorCache, config: AnalyticsConfig) -> Self {
        Self {
            source,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Running semesters of the scope's year, or its closed ones when none
    /// of the running semesters match.
    async fn scope_semesters(&self, scope: &Scope) -> Result<Vec<SemesterRef>> {
        let in_scope = |s: &SemesterRef| scope.semester.map_or(true, |i| s.semester_index == i);

        let mut semesters: Vec<SemesterRef> = self
            .source
            .current_semesters(&scope.department)
            .await?
            .into_iter()
            .filter(|s| s.year.as_deref().map_or(true, |y| y == scope.year))
            .filter(|s| in_scope(s))
            .collect();
        if semesters.is_empty() {
            semesters = self
                .source
                .archived_semesters(&scope.department, &scope.year)
                .await?
                .into_iter()
                .filter(|s| in_scope(s))
                .collect();
        }
        if semesters.is_empty() {
            info!(department = %scope.department, year = %scope.year, "no semester in scope");
        }
        Ok(semesters)
    }

    async fn load(&self, department: &str, semesters: &[SemesterRef]) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        for semester in semesters {
            let results = self.source.semester_results(department, semester.id).await?;
            let programme = self.source.programme_modules(department, semester.id).await?;
            let records = normalize_semester(&results, &programme, semester);

            let mut absences = self.source.semester_absences(department, semester.id).await?;
            if absences.is_empty() {
                absences = aggregate::absences_from_records(&records);
            }
            debug!(
                department,
                semester_id = semester.id,
                records = records.len(),
                absences = absences.len(),
                "semester loaded"
            );
            snapshot.records.extend(records);
            snapshot.absences.extend(absences);
        }
        Ok(snapshot)
    }

    /// Records of the scope, filtered by track and modality.
    pub async fn snapshot(&self, scope: &Scope) -> Result<Snapshot> {
        let semesters = self.scope_semesters(scope).await?;
        let mut snapshot = self.load(&scope.department, &semesters).await?;
        snapshot.records.retain(|r| scope.matches(r));
        Ok(snapshot)
    }

    /// Snapshot plus the same students' records from closed semesters of the
    /// year, so progression between semesters can be measured.
    async fn snapshot_with_history(&self, scope: &Scope) -> Result<Snapshot> {
        let semesters = self.scope_semesters(scope).await?;
        let mut snapshot = self.load(&scope.department, &semesters).await?;
        snapshot.records.retain(|r| scope.matches(r));

        let loaded: BTreeSet<i64> = semesters.iter().map(|s| s.id).collect();
        let archived: Vec<SemesterRef> = self
            .source
            .archived_semesters(&scope.department, &scope.year)
            .await?
            .into_iter()
            .filter(|s| !loaded.contains(&s.id))
            .collect();
        if archived.is_empty() {
            return Ok(snapshot);
        }

        let students: BTreeSet<String> =
            snapshot.records.iter().map(|r| r.student_id.clone()).collect();
        let history = self.load(&scope.department, &archived).await?;
        snapshot.records.extend(
            history
                .records
                .into_iter()
                .filter(|r| students.contains(&r.student_id)),
        );
        Ok(snapshot)
    }

    fn metrics(&self, snapshot: &Snapshot) -> Vec<StudentMetrics> {
        aggregate::student_metrics(
            &snapshot.records,
            &snapshot.absences,
            self.config.expected_hours_per_student,
        )
    }

    pub async fn cohort_statistics(
        &self,
        scope: &Scope,
        force_refresh: bool,
    ) -> Result<CohortStatistics> {
        let key = scope.cache_key(IndicatorKind::CohortStatistics);
        self.cache
            .get_or_compute(
                &key,
                move || async move {
                    let snapshot = self.snapshot(scope).await?;
                    Ok(aggregate::aggregate(&snapshot.records))
                },
                TtlTier::Medium,
                force_refresh,
            )
            .await
    }

    pub async fn track_breakdown(
        &self,
        scope: &Scope,
        force_refresh: bool,
    ) -> Result<Vec<TrackStatistics>> {
        let key = scope.cache_key(IndicatorKind::TrackBreakdown);
        self.cache
            .get_or_compute(
                &key,
                move || async move {
                    let snapshot = self.snapshot(scope).await?;
                    Ok(aggregate::track_breakdown(&snapshot.records))
                },
                TtlTier::Medium,
                force_refresh,
            )
            .await
    }

    pub async fn module_analysis(
        &self,
        scope: &Scope,
        sort: ModuleSort,
        force_refresh: bool,
    ) -> Result<Vec<ModuleAnalysis>> {
        let key = scope
            .cache_key(IndicatorKind::ModuleAnalysis)
            .with_filter("sort", Some(sort.as_str()));
        self.cache
            .get_or_compute(
                &key,
                move || async move {
                    let snapshot = self.snapshot(scope).await?;
                    Ok(aggregate::module_analysis(&snapshot.records, sort))
                },
                TtlTier::Medium,
                force_refresh,
            )
            .await
    }

    pub async fn absenteeism(
        &self,
        scope: &Scope,
        force_refresh: bool,
    ) -> Result<AbsenteeismAnalysis> {
        let key = scope.cache_key(IndicatorKind::Absenteeism);
        self.cache
            .get_or_compute(
                &key,
                move || async move {
                    let snapshot = self.snapshot(scope).await?;
                    Ok(aggregate::absenteeism_analysis(
                        &snapshot.records,
                        &snapshot.absences,
                        self.config.expected_hours_per_student,
                    ))
                },
                TtlTier::Short,
                force_refresh,
            )
            .await
    }

    /// Alerts and risk score of every student in scope, riskiest first.
    pub async fn cohort_alerts(
        &self,
        scope: &Scope,
        force_refresh: bool,
    ) -> Result<Vec<StudentEvaluation>> {
        let key = scope.cache_key(IndicatorKind::CohortAlerts);
        self.cache
            .get_or_compute(
                &key,
                move || async move {
                    let snapshot = self.snapshot_with_history(scope).await?;
                    Ok(risk::evaluate_cohort(&self.metrics(&snapshot), &self.config.alerts))
                },
                TtlTier::Short,
                force_refresh,
            )
            .await
    }

    /// Evaluation of one student, `None` when the student is not in scope.
    pub async fn student_evaluation(
        &self,
        scope: &Scope,
        student_id: &str,
        force_refresh: bool,
    ) -> Result<Option<StudentEvaluation>> {
        let key = scope
            .cache_key(IndicatorKind::StudentEvaluation)
            .with_filter("student", Some(student_id));
        self.cache
            .get_or_compute(
                &key,
                move || async move {
                    let snapshot = self.snapshot_with_history(scope).await?;
                    let Some(metrics) = self
                        .metrics(&snapshot)
                        .into_iter()
                        .find(|m| m.student_id == student_id)
                    else {
                        return Ok(None);
                    };
                    let (alerts, risk) = risk::evaluate(&metrics, &self.config.alerts);
                    Ok(Some(StudentEvaluation {
                        student_id: metrics.student_id,
                        alerts,
                        risk,
                    }))
                },
                TtlTier::Student,
                force_refresh,
            )
            .await
    }

    /// Cohort statistics of the scope over several academic years.
    pub async fn interannual(
        &self,
        scope: &Scope,
        years: &[String],
        force_refresh: bool,
    ) -> Result<InterannualComparison> {
        let mut sorted_years = years.to_vec();
        sorted_years.sort();
        sorted_years.dedup();
        let joined = sorted_years.join(",");
        let key = scope
            .cache_key(IndicatorKind::Interannual)
            .with_filter("years", Some(joined.as_str()));

        self.cache
            .get_or_compute(
                &key,
                move || async move {
                    let mut points = Vec::with_capacity(sorted_years.len());
                    for year in &sorted_years {
                        let statistics = self
                            .cohort_statistics(&scope.for_year(year), force_refresh)
                            .await?;
                        points.push((year.clone(), statistics));
                    }
                    Ok(aggregate::interannual_comparison(&points))
                },
                TtlTier::Long,
                force_refresh,
            )
            .await
    }

    /// Drops every cached indicator of a department.
    pub async fn clear_department(&self, department: &str) -> u64 {
        self.cache.invalidate_department(department).await
    }
}
