//! Access to the student-information API payloads.
//!
//! The HTTP client of the real API lives outside this crate; the engine only
//! needs the [`AcademicSource`] capability. [`FileSource`] serves exported
//! payloads from disk:
//!
//! ```text
//! <root>/<department>/semesters.json      current (and archived) semesters
//! <root>/<department>/results_<id>.json   semester results
//! <root>/<department>/absences_<id>.csv   absence hours per student
//! <root>/<department>/programme_<id>.json module id -> code/title
//! ```
//!
//! A missing file means "no data" and yields an empty result.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{AbsenceSummary, ProgrammeModule, ProgrammeModules, SemesterRef};
use crate::normalize::{parse_grade, RawRecord};
use crate::Result;

#[async_trait]
pub trait AcademicSource: Send + Sync {
    /// Semesters currently running in the department
    async fn current_semesters(&self, department: &str) -> Result<Vec<SemesterRef>>;

    /// Closed semesters of a past academic year
    async fn archived_semesters(&self, department: &str, year: &str) -> Result<Vec<SemesterRef>> {
        let _ = (department, year);
        Ok(Vec::new())
    }

    /// Raw results payload of one semester
    async fn semester_results(&self, department: &str, semester_id: i64) -> Result<Value>;

    /// Absence hours recorded for one semester
    async fn semester_absences(
        &self,
        department: &str,
        semester_id: i64,
    ) -> Result<Vec<AbsenceSummary>>;

    /// Module lookup of the programme a semester follows
    async fn programme_modules(&self, department: &str, semester_id: i64)
        -> Result<ProgrammeModules>;
}

/// Directory of exported API payloads.
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, department: &str, file: &str) -> PathBuf {
        self.root.join(department).join(file)
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no data file at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_json(path: &Path) -> Result<Value> {
        match Self::read_optional(path).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Value::Null),
        }
    }

    async fn semester_index(&self, department: &str) -> Result<SemesterIndex> {
        let raw = Self::read_json(&self.path(department, "semesters.json")).await?;
        Ok(match raw {
            Value::Null => SemesterIndex::default(),
            Value::Array(_) => SemesterIndex {
                current: serde_json::from_value(raw)?,
                archived: Vec::new(),
            },
            other => serde_json::from_value(other)?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SemesterIndex {
    #[serde(default)]
    current: Vec<SemesterRef>,
    #[serde(default)]
    archived: Vec<SemesterRef>,
}

#[derive(Debug, Deserialize)]
struct AbsenceRow {
    student_id: String,
    hours_total: String,
    #[serde(default)]
    hours_justified: Option<String>,
    #[serde(default)]
    hours_unjustified: Option<String>,
}

/// Parses an absence export. Rows that do not parse are skipped.
pub fn parse_absences_csv(bytes: &[u8]) -> Result<Vec<AbsenceSummary>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);
    let mut absences = Vec::new();

    for (line, result) in reader.deserialize::<AbsenceRow>().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!(line = line + 2, "skipping absence row: {e}");
                continue;
            }
        };
        let Some(hours_total) = parse_grade(&row.hours_total).filter(|h| *h >= 0.0) else {
            warn!(line = line + 2, student_id = %row.student_id, "skipping absence row without hours");
            continue;
        };
        let hours_justified = row
            .hours_justified
            .as_deref()
            .and_then(parse_grade)
            .unwrap_or(0.0);
        let hours_unjustified = row
            .hours_unjustified
            .as_deref()
            .and_then(parse_grade)
            .unwrap_or((hours_total - hours_justified).max(0.0));
        absences.push(AbsenceSummary {
            student_id: row.student_id,
            hours_total,
            hours_justified,
            hours_unjustified,
        });
    }
    Ok(absences)
}

/// Reads a programme payload: a list of modules, bare or under `modules`.
pub fn parse_programme(raw: &Value) -> ProgrammeModules {
    let entries = match raw {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("modules")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    };

    let mut modules = ProgrammeModules::new();
    for entry in entries {
        let Some(map) = entry.as_object() else {
            continue;
        };
        let raw = RawRecord::new(map);
        let (Some(id), Some(code)) = (
            raw.integer(&["id", "moduleimpl_id", "modimpl_id"]),
            raw.text(&["code", "module_code"]),
        ) else {
            debug!("skipping programme entry without id or code");
            continue;
        };
        let title = raw.text(&["titre", "title", "libelle"]).unwrap_or_default();
        modules.insert(id, ProgrammeModule { code, title });
    }
    modules
}

#[async_trait]
impl AcademicSource for FileSource {
    async fn current_semesters(&self, department: &str) -> Result<Vec<SemesterRef>> {
        Ok(self.semester_index(department).await?.current)
    }

    async fn archived_semesters(&self, department: &str, year: &str) -> Result<Vec<SemesterRef>> {
        let index = self.semester_index(department).await?;
        Ok(index
            .archived
            .into_iter()
            .filter(|s| s.year.as_deref() == Some(year))
            .collect())
    }

    async fn semester_results(&self, department: &str, semester_id: i64) -> Result<Value> {
        Self::read_json(&self.path(department, &format!("results_{semester_id}.json"))).await
    }

    async fn semester_absences(
        &self,
        department: &str,
        semester_id: i64,
    ) -> Result<Vec<AbsenceSummary>> {
        let path = self.path(department, &format!("absences_{semester_id}.csv"));
        match Self::read_optional(&path).await? {
            Some(bytes) => parse_absences_csv(&bytes),
            None => Ok(Vec::new()),
        }
    }

    async fn programme_modules(
        &self,
        department: &str,
        semester_id: i64,
    ) -> Result<ProgrammeModules> {
        let raw =
            Self::read_json(&self.path(department, &format!("programme_{semester_id}.json")))
                .await?;
        Ok(parse_programme(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_absence_csv_tolerantly() {
        let csv = b"student_id,hours_total,hours_justified,hours_unjustified\n\
                    1001,\"12,5\",4,\n\
                    1002,abc,0,0\n\
                    1003,30,10,20\n";
        let absences = parse_absences_csv(csv).unwrap();
        assert_eq!(absences.len(), 2);
        assert_eq!(absences[0].student_id, "1001");
        assert_eq!(absences[0].hours_total, 12.5);
        assert_eq!(absences[0].hours_unjustified, 8.5);
        assert_eq!(absences[1].hours_unjustified, 20.0);
    }

    #[test]
    fn parses_programme_shapes() {
        let bare = json!([{ "id": 12, "code": "R101", "titre": "Initiation" }, { "code": "X" }]);
        let modules = parse_programme(&bare);
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[&12].code, "R101");

        let wrapped = json!({ "modules": [{ "moduleimpl_id": "15", "module_code": "SAE1.01" }] });
        assert_eq!(parse_programme(&wrapped)[&15].code, "SAE1.01");
        assert!(parse_programme(&Value::Null).is_empty());
    }
}
