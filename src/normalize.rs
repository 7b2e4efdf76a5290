//! Record normalization.
//!
//! Turns one "semester results" payload of the student-information API into
//! canonical [`StudentRecord`]s. The API changed shape across versions, so every
//! field is read through a total accessor returning `Option`: an absent field,
//! `null` and the `"~"` sentinel ("not computed") all mean "no value", never 0.
//!
//! Module averages live in compound keys such as `moy_res_12_3`: resource
//! (or `sae`) module 12 as weighted inside UE 3. Keys that do not parse are
//! skipped, never fatal.

use std::borrow::Cow;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::models::{
    AbsenceSummary, ModuleGrade, ProgrammeModules, SemesterRef, StudentRecord, TrackType,
};

/// "Not computed" marker used by the API in place of a grade.
pub const NOT_COMPUTED: &str = "~";

const RESULT_LIST_KEYS: &[&str] = &["resultats", "etudiants", "results"];
const STUDENT_ID_KEYS: &[&str] = &["etudid", "code_nip", "id"];
const NAME_KEYS: &[&str] = &["nom", "nom_disp", "nom_usuel"];
const FIRST_NAME_KEYS: &[&str] = &["prenom"];
const TRACK_KEYS: &[&str] = &["parcours", "parcour"];
const TRACK_TYPE_KEYS: &[&str] = &["modalite", "regime"];
const GENERAL_AVERAGE_KEYS: &[&str] = &["moy_gen", "moyenne_generale", "moyenne"];
const ABSENCE_KEYS: &[&str] = &["nbabs", "nb_abs"];
const JUSTIFIED_ABSENCE_KEYS: &[&str] = &["nbabsjust", "nb_abs_just"];
const SEMESTER_INDEX_KEYS: &[&str] = &["semestre_idx", "semestre_id"];
const SEMESTER_ID_KEYS: &[&str] = &["formsemestre_id", "id"];

/// Kind of teaching unit encoded in a module key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Resource,
    Sae,
}

/// Decoded `moy_<kind>_<module_id>_<ue_id>` field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleKey {
    pub kind: ModuleKind,
    pub module_id: i64,
    pub ue_id: i64,
}

/// Parses a compound module key. Returns `None` for any other field name
/// and for malformed module keys.
pub fn parse_module_key(key: &str) -> Option<ModuleKey> {
    let mut parts = key.split('_');
    if parts.next()? != "moy" {
        return None;
    }
    let kind = match parts.next()? {
        "res" => ModuleKind::Resource,
        "sae" => ModuleKind::Sae,
        _ => return None,
    };
    let module_id = parts.next()?.parse().ok()?;
    let ue_id = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(ModuleKey {
        kind,
        module_id,
        ue_id,
    })
}

/// Parses a grade written with either a comma or a dot decimal separator.
pub fn parse_grade(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() || text == NOT_COMPUTED {
        return None;
    }
    let value: f64 = text.replace(',', ".").parse().ok()?;
    value.is_finite().then_some(value)
}

/// Reads a grade out of a raw JSON value. Grades outside 0-20 are rejected.
pub fn normalize_grade(value: &Value) -> Option<f64> {
    let grade = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_grade(s),
        _ => None,
    }?;
    (0.0..=20.0).contains(&grade).then_some(grade)
}

/// Lower-cases, strips accents and collapses every run of other characters
/// into a single `_`.
///
/// Input is decomposed (NFD) first, so precomposed and combining-mark
/// spellings of the same accented letter give the same slug.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_sep = true;
    for ch in input.nfd().filter(|c| !is_combining_mark(*c)) {
        for c in fold_letter(ch).chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                out.push(c);
                last_was_sep = false;
            } else if !last_was_sep {
                out.push('_');
                last_was_sep = true;
            }
        }
    }
    out.trim_matches('_').to_string()
}

/// Latin letters that have no canonical decomposition.
fn fold_letter(ch: char) -> Cow<'static, str> {
    let folded = match ch {
        'ø' | 'Ø' => "o",
        'ł' | 'Ł' => "l",
        'đ' | 'Đ' => "d",
        'ı' => "i",
        'ß' => "ss",
        'œ' | 'Œ' => "oe",
        'æ' | 'Æ' => "ae",
        other => return Cow::Owned(other.to_string()),
    };
    Cow::Borrowed(folded)
}

/// Borrowed view over one loosely-typed student (or semester) object.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> RawRecord<'a> {
    pub fn new(fields: &'a Map<String, Value>) -> Self {
        Self { fields }
    }

    /// First present, non-sentinel value among `keys`.
    fn value(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .filter_map(|key| self.fields.get(*key))
            .find(|value| match value {
                Value::Null => false,
                Value::String(s) => {
                    let s = s.trim();
                    !s.is_empty() && s != NOT_COMPUTED
                }
                _ => true,
            })
    }

    /// Text value; numbers are rendered so numeric identifiers stay usable.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        match self.value(keys)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn grade(&self, keys: &[&str]) -> Option<f64> {
        normalize_grade(self.value(keys)?)
    }

    /// Non-negative quantity such as a number of hours.
    pub fn quantity(&self, keys: &[&str]) -> Option<f64> {
        let amount = match self.value(keys)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_grade(s),
            _ => None,
        }?;
        (amount >= 0.0).then_some(amount)
    }

    pub fn integer(&self, keys: &[&str]) -> Option<i64> {
        match self.value(keys)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'a String, &'a Value)> {
        self.fields.iter()
    }
}

fn results_list(raw: &Value) -> Option<&Vec<Value>> {
    match raw {
        Value::Array(items) => Some(items),
        Value::Object(map) => RESULT_LIST_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array)),
        _ => None,
    }
}

fn semester_context(raw: &Value) -> (String, Option<i64>) {
    let Some(map) = raw.as_object() else {
        return (String::new(), None);
    };
    let semester = RawRecord::new(map);
    let label = semester
        .integer(SEMESTER_INDEX_KEYS)
        .map(|idx| format!("S{idx}"))
        .or_else(|| semester.text(&["semestre"]))
        .unwrap_or_default();
    (label, semester.integer(SEMESTER_ID_KEYS))
}

/// Normalizes one semester results payload.
///
/// Each student entry yields one record. The same student appearing in another
/// semester's payload yields a separate record; cross-semester merging belongs
/// to the aggregator.
pub fn normalize(raw: &Value, programme: &ProgrammeModules) -> Vec<StudentRecord> {
    let (semester_label, semester_id) = semester_context(raw);
    normalize_in(raw, programme, semester_label, semester_id)
}

/// Like [`normalize`], using `semester` when the payload does not say which
/// semester it belongs to.
pub fn normalize_semester(
    raw: &Value,
    programme: &ProgrammeModules,
    semester: &SemesterRef,
) -> Vec<StudentRecord> {
    let (label, id) = semester_context(raw);
    let label = if label.is_empty() {
        format!("S{}", semester.semester_index)
    } else {
        label
    };
    normalize_in(raw, programme, label, id.or(Some(semester.id)))
}

fn normalize_in(
    raw: &Value,
    programme: &ProgrammeModules,
    semester_label: String,
    semester_id: Option<i64>,
) -> Vec<StudentRecord> {
    let Some(entries) = results_list(raw) else {
        debug!("semester payload carries no results list");
        return Vec::new();
    };

    let mut records = Vec::with_capacity(entries.len());
    for (position, entry) in entries.iter().enumerate() {
        match normalize_student(entry, programme, &semester_label, semester_id) {
            Ok(record) => records.push(record),
            Err(reason) => warn!(position, semester = %semester_label, "skipping student record: {reason}"),
        }
    }
    records
}

fn normalize_student(
    entry: &Value,
    programme: &ProgrammeModules,
    semester_label: &str,
    semester_id: Option<i64>,
) -> Result<StudentRecord, String> {
    let map = entry
        .as_object()
        .ok_or_else(|| "entry is not an object".to_string())?;
    let raw = RawRecord::new(map);
    let student_id = raw
        .text(STUDENT_ID_KEYS)
        .ok_or_else(|| "no student identifier".to_string())?;

    let absences = raw.quantity(ABSENCE_KEYS).map(|hours_total| {
        let hours_justified = raw.quantity(JUSTIFIED_ABSENCE_KEYS).unwrap_or(0.0);
        AbsenceSummary {
            student_id: student_id.clone(),
            hours_total,
            hours_justified,
            hours_unjustified: (hours_total - hours_justified).max(0.0),
        }
    });

    Ok(StudentRecord {
        name: raw.text(NAME_KEYS).unwrap_or_default(),
        first_name: raw.text(FIRST_NAME_KEYS).unwrap_or_default(),
        track: raw.text(TRACK_KEYS),
        track_type: raw
            .text(TRACK_TYPE_KEYS)
            .map(|label| TrackType::from_label(&label))
            .unwrap_or_default(),
        semester_id,
        semester_label: semester_label.to_string(),
        general_average: raw.grade(GENERAL_AVERAGE_KEYS),
        module_grades: module_grades(&raw, programme, semester_label, semester_id, &student_id),
        absences,
        student_id,
    })
}

fn module_grades(
    raw: &RawRecord<'_>,
    programme: &ProgrammeModules,
    semester_label: &str,
    semester_id: Option<i64>,
    student_id: &str,
) -> Vec<ModuleGrade> {
    let mut grades: Vec<ModuleGrade> = Vec::new();
    for (field, value) in raw.fields() {
        if !field.starts_with("moy_res_") && !field.starts_with("moy_sae_") {
            continue;
        }
        let Some(key) = parse_module_key(field) else {
            debug!(student_id, field = %field, "malformed module key");
            continue;
        };
        let Some(average) = normalize_grade(value) else {
            continue;
        };
        let (code, title) = match programme.get(&key.module_id) {
            Some(module) => (module.code.clone(), module.title.clone()),
            None => (format!("MOD{}", key.module_id), String::new()),
        };
        // A module weighted in several UEs shows up once per UE.
        if grades.iter().any(|g| g.module_id == key.module_id) {
            continue;
        }
        grades.push(
            ModuleGrade::new(key.module_id, code, title, Some(average), semester_label)
                .with_semester_id(semester_id),
        );
    }
    grades
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProgrammeModule;
    use serde_json::json;

    fn programme() -> ProgrammeModules {
        let mut modules = ProgrammeModules::new();
        modules.insert(
            12,
            ProgrammeModule {
                code: "R101".to_string(),
                title: "Initiation au développement".to_string(),
            },
        );
        modules.insert(
            15,
            ProgrammeModule {
                code: "SAE1.01".to_string(),
                title: "Implémentation d'un besoin client".to_string(),
            },
        );
        modules
    }

    #[test]
    fn comma_and_dot_grades_agree() {
        assert_eq!(parse_grade("16,5"), Some(16.5));
        assert_eq!(parse_grade("16.5"), Some(16.5));
        assert_eq!(normalize_grade(&json!("16,38")), Some(16.38));
        assert_eq!(normalize_grade(&json!(16.5)), Some(16.5));
    }

    #[test]
    fn sentinels_are_no_value() {
        assert_eq!(normalize_grade(&json!("~")), None);
        assert_eq!(normalize_grade(&Value::Null), None);
        assert_eq!(normalize_grade(&json!("ABS")), None);
        assert_eq!(normalize_grade(&json!("")), None);
        assert_eq!(normalize_grade(&json!(25.0)), None);
    }

    #[test]
    fn module_keys_parse_defensively() {
        assert_eq!(
            parse_module_key("moy_res_12_3"),
            Some(ModuleKey {
                kind: ModuleKind::Resource,
                module_id: 12,
                ue_id: 3
            })
        );
        assert_eq!(parse_module_key("moy_sae_15_4").map(|k| k.kind), Some(ModuleKind::Sae));
        assert_eq!(parse_module_key("moy_res_x_3"), None);
        assert_eq!(parse_module_key("moy_res_12"), None);
        assert_eq!(parse_module_key("moy_res_12_3_9"), None);
        assert_eq!(parse_module_key("moy_gen"), None);
    }

    #[test]
    fn slug_strips_accents_and_case() {
        assert_eq!(slug("Réalisation d'applications"), "realisation_d_applications");
        assert_eq!(slug("REALISATION  D'APPLICATIONS"), "realisation_d_applications");
        assert_eq!(slug("  --Cœur--  "), "coeur");
    }

    #[test]
    fn slug_ignores_accent_encoding() {
        assert_eq!(slug("R\u{e9}alisation"), "realisation");
        assert_eq!(slug("Re\u{301}alisation"), "realisation");
        assert_eq!(slug("Gr\u{f8}nland \u{141}\u{f3}d\u{17a} Stra\u{df}e"), "gronland_lodz_strasse");
    }

    #[test]
    fn normalizes_a_semester_payload() {
        let raw = json!({
            "formsemestre_id": 881,
            "semestre_idx": 3,
            "resultats": [
                {
                    "etudid": 1001,
                    "nom": "DURAND",
                    "prenom": "Léa",
                    "parcours": "Réalisation d'applications",
                    "modalite": "FI",
                    "moy_gen": "12,45",
                    "moy_res_12_3": "9,5",
                    "moy_res_12_4": "11,0",
                    "moy_sae_15_3": "~",
                    "moy_res_bad_3": "14",
                    "nbabs": 12,
                    "nbabsjust": "4"
                },
                {
                    "code_nip": "21900042",
                    "nom_disp": "MARTIN",
                    "moy_gen": null
                },
                { "nom": "ANONYME" },
                "not an object"
            ]
        });

        let records = normalize(&raw, &programme());
        assert_eq!(records.len(), 2);

        let lea = &records[0];
        assert_eq!(lea.student_id, "1001");
        assert_eq!(lea.semester_label, "S3");
        assert_eq!(lea.semester_id, Some(881));
        assert_eq!(lea.general_average, Some(12.45));
        assert_eq!(lea.track_type, TrackType::Initial);
        assert_eq!(lea.module_grades.len(), 1);
        assert_eq!(lea.module_grades[0].module_code, "R101");
        assert_eq!(lea.module_grades[0].average, Some(9.5));
        assert!(!lea.module_grades[0].validated);
        let absences = lea.absences.as_ref().unwrap();
        assert_eq!(absences.hours_total, 12.0);
        assert_eq!(absences.hours_unjustified, 8.0);

        let martin = &records[1];
        assert_eq!(martin.student_id, "21900042");
        assert_eq!(martin.name, "MARTIN");
        assert_eq!(martin.general_average, None);
        assert!(martin.module_grades.is_empty());
        assert!(martin.absences.is_none());
    }

    #[test]
    fn distinct_modules_sharing_a_code_are_both_kept() {
        let mut modules = programme();
        modules.insert(
            13,
            ProgrammeModule {
                code: "R101".to_string(),
                title: "Initiation au développement (groupe B)".to_string(),
            },
        );
        let raw = json!({
            "semestre_idx": 1,
            "resultats": [{ "etudid": 7, "moy_res_12_1": "11", "moy_res_12_2": "11", "moy_res_13_1": "9" }]
        });
        let grades = &normalize(&raw, &modules)[0].module_grades;
        let ids: Vec<i64> = grades.iter().map(|g| g.module_id).collect();
        assert_eq!(ids, vec![12, 13]);
    }

    #[test]
    fn unknown_module_ids_fall_back_to_generated_code() {
        let raw = json!({ "semestre_idx": 1, "resultats": [{ "etudid": 7, "moy_res_99_1": 13 }] });
        let records = normalize(&raw, &ProgrammeModules::new());
        assert_eq!(records[0].module_grades[0].module_code, "MOD99");
    }

    #[test]
    fn missing_results_list_yields_nothing() {
        assert!(normalize(&json!({ "semestre_idx": 1 }), &programme()).is_empty());
        assert!(normalize(&Value::Null, &programme()).is_empty());
    }

    #[test]
    fn listed_semester_fills_missing_context() {
        let semester = SemesterRef {
            id: 910,
            semester_index: 5,
            year: Some("2024-2025".to_string()),
            title: None,
        };
        let raw = json!({ "resultats": [{ "etudid": 3, "moy_res_12_7": "8,0" }] });
        let records = normalize_semester(&raw, &programme(), &semester);
        assert_eq!(records[0].semester_label, "S5");
        assert_eq!(records[0].semester_id, Some(910));
        assert_eq!(records[0].module_grades[0].semester_label, "S5");
        assert_eq!(records[0].module_grades[0].semester_id, Some(910));

        let labelled = json!({ "semestre_idx": 3, "resultats": [{ "etudid": 3 }] });
        assert_eq!(normalize_semester(&labelled, &programme(), &semester)[0].semester_label, "S3");
    }

    #[test]
    fn bare_list_payload_is_accepted() {
        let raw = json!([{ "etudid": 3, "moy_gen": 11 }]);
        let records = normalize(&raw, &programme());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].semester_label, "");
    }
}
