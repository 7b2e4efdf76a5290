use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use cohort_indicators::aggregate::ModuleSort;
use cohort_indicators::cache::{IndicatorCache, MemoryCache};
use cohort_indicators::config::AnalyticsConfig;
use cohort_indicators::models::{
    AbsenceSummary, AlertType, ProgrammeModules, SemesterRef, Severity, Trend,
};
use cohort_indicators::source::{AcademicSource, FileSource};
use cohort_indicators::{IndicatorService, Result, Scope};

const YEAR: &str = "2024-2025";
const PREVIOUS_YEAR: &str = "2023-2024";

fn semester(id: i64, index: u32, year: &str) -> SemesterRef {
    SemesterRef {
        id,
        semester_index: index,
        year: Some(year.to_string()),
        title: None,
    }
}

/// In-memory source for the INFO department, counting result fetches.
struct FakeSource {
    current: Vec<SemesterRef>,
    archived: Vec<SemesterRef>,
    results: HashMap<i64, Value>,
    result_calls: Arc<AtomicUsize>,
}

impl FakeSource {
    fn new() -> Self {
        let mut results = HashMap::new();
        results.insert(
            10,
            json!({
                "semestre_idx": 3,
                "formsemestre_id": 10,
                "resultats": [
                    {
                        "etudid": 1, "nom": "MARTIN", "prenom": "Alice",
                        "parcours": "Réalisation d'applications", "modalite": "FI",
                        "moy_gen": "12,5", "moy_res_101_1": "13", "nbabs": 10, "nbabsjust": 4
                    },
                    {
                        "etudid": 2, "nom": "DURAND", "prenom": "Bob",
                        "parcours": "Déploiement", "modalite": "FA",
                        "moy_gen": "7.0", "moy_res_101_1": "6", "nbabs": 90, "nbabsjust": 0
                    },
                    { "etudid": 3, "nom": "PETIT", "prenom": "Chloé", "modalite": "FI", "moy_gen": "~" }
                ]
            }),
        );
        results.insert(
            9,
            json!({
                "semestre_idx": 2,
                "resultats": [
                    { "etudid": 2, "moy_gen": 12.0 },
                    { "etudid": 99, "moy_gen": 15.0 }
                ]
            }),
        );
        results.insert(
            5,
            json!({
                "semestre_idx": 1,
                "resultats": [
                    { "etudid": 50, "moy_gen": 10.0 },
                    { "etudid": 51, "moy_gen": 8.0 }
                ]
            }),
        );

        Self {
            current: vec![semester(10, 3, YEAR)],
            archived: vec![semester(9, 2, YEAR), semester(5, 1, PREVIOUS_YEAR)],
            results,
            result_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl AcademicSource for FakeSource {
    async fn current_semesters(&self, department: &str) -> Result<Vec<SemesterRef>> {
        Ok(if department == "INFO" {
            self.current.clone()
        } else {
            Vec::new()
        })
    }

    async fn archived_semesters(&self, department: &str, year: &str) -> Result<Vec<SemesterRef>> {
        if department != "INFO" {
            return Ok(Vec::new());
        }
        Ok(self
            .archived
            .iter()
            .filter(|s| s.year.as_deref() == Some(year))
            .cloned()
            .collect())
    }

    async fn semester_results(&self, _department: &str, semester_id: i64) -> Result<Value> {
        self.result_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.results.get(&semester_id).cloned().unwrap_or(Value::Null))
    }

    async fn semester_absences(
        &self,
        _department: &str,
        _semester_id: i64,
    ) -> Result<Vec<AbsenceSummary>> {
        Ok(Vec::new())
    }

    async fn programme_modules(
        &self,
        _department: &str,
        _semester_id: i64,
    ) -> Result<ProgrammeModules> {
        Ok(ProgrammeModules::new())
    }
}

fn service() -> (IndicatorService<FakeSource>, Arc<AtomicUsize>) {
    let source = FakeSource::new();
    let calls = Arc::clone(&source.result_calls);
    let cache = IndicatorCache::new(Arc::new(MemoryCache::new()));
    (
        IndicatorService::new(source, cache, AnalyticsConfig::default()),
        calls,
    )
}

fn info() -> Scope {
    Scope::new("INFO", YEAR)
}

#[tokio::test]
async fn cohort_statistics_are_cached_until_forced() {
    let (service, calls) = service();

    let stats = service.cohort_statistics(&info(), false).await.unwrap();
    assert_eq!(stats.student_count, 3);
    assert_eq!(stats.graded_count, 2);
    assert_eq!(stats.stats.mean, 9.75);
    assert_eq!(stats.success_rate, 0.5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let again = service.cohort_statistics(&info(), false).await.unwrap();
    assert_eq!(again, stats);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    service.cohort_statistics(&info(), true).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn closed_semester_of_the_current_year_is_reachable() {
    let (service, calls) = service();

    let closed = info().with_semester(Some(2));
    let stats = service.cohort_statistics(&closed, false).await.unwrap();
    assert_eq!(stats.student_count, 2);
    assert_eq!(stats.stats.mean, 13.5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let running = info().with_semester(Some(3));
    assert_eq!(service.cohort_statistics(&running, false).await.unwrap().student_count, 3);

    let missing = info().with_semester(Some(5));
    assert_eq!(service.cohort_statistics(&missing, false).await.unwrap().student_count, 0);
}

#[tokio::test]
async fn track_and_modality_filters_narrow_the_cohort() {
    let (service, _) = service();

    let by_track = info().with_track(Some("realisation d'applications".to_string()));
    let stats = service.cohort_statistics(&by_track, false).await.unwrap();
    assert_eq!(stats.student_count, 1);
    assert_eq!(stats.stats.mean, 12.5);

    let apprentices = info().with_modality(Some("FA".to_string()));
    let stats = service.cohort_statistics(&apprentices, false).await.unwrap();
    assert_eq!(stats.student_count, 1);
    assert_eq!(stats.stats.mean, 7.0);

    let tracks = service.track_breakdown(&info(), false).await.unwrap();
    let labels: Vec<&str> = tracks.iter().map(|t| t.track.as_str()).collect();
    assert_eq!(labels, vec!["Déploiement", "Réalisation d'applications", "unspecified"]);
}

#[tokio::test]
async fn cohort_alerts_rank_the_riskiest_student_first() {
    let (service, _) = service();

    let evaluations = service.cohort_alerts(&info(), false).await.unwrap();
    assert_eq!(evaluations.len(), 3);

    let riskiest = &evaluations[0];
    assert_eq!(riskiest.student_id, "2");
    let kinds: Vec<(AlertType, Severity)> = riskiest
        .alerts
        .iter()
        .map(|a| (a.alert_type, a.severity))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (AlertType::Attendance, Severity::Critical),
            (AlertType::NegativeProgression, Severity::Critical),
            (AlertType::AcademicDifficulty, Severity::Attention),
            (AlertType::DropoutRisk, Severity::Attention),
        ]
    );
    assert!((riskiest.risk.global_score - 0.6575).abs() < 1e-9);

    // Students only present in closed semesters are not part of the cohort.
    assert!(evaluations.iter().all(|e| e.student_id != "99"));
    let ungraded = evaluations.iter().find(|e| e.student_id == "3").unwrap();
    assert!(ungraded.alerts.is_empty());
}

#[tokio::test]
async fn student_evaluation_reports_missing_students_as_none() {
    let (service, _) = service();

    let bob = service
        .student_evaluation(&info(), "2", false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bob.alerts.len(), 4);

    assert!(service
        .student_evaluation(&info(), "999", false)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn absenteeism_falls_back_to_payload_hours() {
    let (service, _) = service();

    let absences = service.absenteeism(&info(), false).await.unwrap();
    assert_eq!(absences.student_count, 3);
    assert_eq!(absences.hours_total, 100.0);
    assert_eq!(absences.hours_justified, 4.0);
    assert_eq!(absences.students_above_attention, 1);
    assert_eq!(absences.top_absentees[0].student_id, "2");
    assert!(!absences.inconsistent);
}

#[tokio::test]
async fn unknown_department_yields_empty_indicators() {
    let (service, calls) = service();
    let geii = Scope::new("GEII", YEAR);

    let stats = service.cohort_statistics(&geii, false).await.unwrap();
    assert_eq!(stats.student_count, 0);
    assert_eq!(stats.stats.mean, 0.0);
    assert!(service.module_analysis(&geii, ModuleSort::Mean, false).await.unwrap().is_empty());
    assert!(service.cohort_alerts(&geii, false).await.unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn interannual_compares_years_oldest_first() {
    let (service, _) = service();
    let years = vec![YEAR.to_string(), PREVIOUS_YEAR.to_string()];

    let comparison = service.interannual(&info(), &years, false).await.unwrap();
    let order: Vec<&str> = comparison.points.iter().map(|p| p.year.as_str()).collect();
    assert_eq!(order, vec![PREVIOUS_YEAR, YEAR]);
    assert_eq!(comparison.points[0].mean, 9.0);
    assert_eq!(comparison.mean_delta, 0.75);
    assert_eq!(comparison.trend, Trend::Up);
}

#[tokio::test]
async fn clearing_a_department_forces_recomputation() {
    let (service, calls) = service();

    service.cohort_statistics(&info(), false).await.unwrap();
    service.absenteeism(&info(), false).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert_eq!(service.clear_department("info").await, 2);

    service.cohort_statistics(&info(), false).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn file_source_serves_exported_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let department = dir.path().join("INFO");
    std::fs::create_dir_all(&department).unwrap();

    std::fs::write(
        department.join("semesters.json"),
        r#"[{ "formsemestre_id": 10, "semestre_id": 1, "annee_scolaire": "2024-2025" }]"#,
    )
    .unwrap();
    std::fs::write(
        department.join("results_10.json"),
        json!({
            "etudiants": [
                { "etudid": 1, "moy_gen": "11", "moy_res_7_1": "9,5" },
                { "etudid": 2, "moy_gen": "14", "moy_res_7_1": "15" },
                { "nom": "no identifier" }
            ]
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        department.join("programme_10.json"),
        r#"{ "modules": [{ "id": 7, "code": "R101", "titre": "Initiation au développement" }] }"#,
    )
    .unwrap();
    std::fs::write(
        department.join("absences_10.csv"),
        "student_id,hours_total,hours_justified\n1,20,5\n2,\"4,5\",4\n",
    )
    .unwrap();

    let service = IndicatorService::new(
        FileSource::new(dir.path()),
        IndicatorCache::disabled(),
        AnalyticsConfig::default(),
    );
    let scope = Scope::new("INFO", YEAR);

    let stats = service.cohort_statistics(&scope, false).await.unwrap();
    assert_eq!(stats.student_count, 2);
    assert_eq!(stats.stats.mean, 12.5);

    let modules = service
        .module_analysis(&scope, ModuleSort::FailureRate, false)
        .await
        .unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].module_code, "R101");
    assert_eq!(modules[0].semesters, vec!["S1".to_string()]);
    assert_eq!(modules[0].failure_rate, 0.5);

    let absences = service.absenteeism(&scope, false).await.unwrap();
    assert_eq!(absences.hours_total, 24.5);
    assert_eq!(absences.hours_justified, 9.0);
}
