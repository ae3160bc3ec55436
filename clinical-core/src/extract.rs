use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::knowledge::{Complication, KnowledgeBase};

/// Systolic/diastolic pair, kept together rather than as two independent
/// numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloodPressure {
    pub systolic: u16,
    pub diastolic: u16,
}

impl fmt::Display for BloodPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.systolic, self.diastolic)
    }
}

/// Structured clinical values pulled from free text. Absent fields stay
/// `None`, never zero: zero is a valid lab value. Built once per document and
/// never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalData {
    pub gfr: Option<f64>,
    pub creatinine: Option<f64>,
    pub bun: Option<f64>,
    pub proteinuria: Option<f64>,
    pub blood_pressure: Option<BloodPressure>,
    #[serde(default)]
    pub diabetes: bool,
    #[serde(default)]
    pub complications: Vec<Complication>,
}

static GFR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:eGFR|GFR|glomerular filtration rate)\s*[:=]?\s*(\d+(?:\.\d+)?)\s*mL/min/1\.73\s*m(?:²|\^?2)",
    )
    .expect("invalid GFR pattern")
});

static CREATININE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:serum\s+)?creatinine\s*[:=]?\s*(\d+(?:\.\d+)?)\s*mg/dL")
        .expect("invalid creatinine pattern")
});

static BUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:BUN|blood urea nitrogen)\s*[:=]?\s*(\d+(?:\.\d+)?)\s*mg/dL")
        .expect("invalid BUN pattern")
});

static PROTEINURIA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:proteinuria|urine protein|protein excretion)\s*[:=]?\s*(\d+(?:\.\d+)?)\s*g/day")
        .expect("invalid proteinuria pattern")
});

static BLOOD_PRESSURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:blood pressure|BP)\s*[:=]?\s*(\d{2,3})\s*/\s*(\d{2,3})\s*mmHg")
        .expect("invalid blood pressure pattern")
});

static DIABETES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:diabetes|diabetic|dm|t1dm|t2dm|iddm|niddm)\b")
        .expect("invalid diabetes pattern")
});

/// One numeric field: label + number + unit pattern plus where the parsed
/// value lands. All entries are evaluated uniformly, first match wins.
struct NumericField {
    pattern: &'static LazyLock<Regex>,
    assign: fn(&mut ClinicalData, f64),
}

static NUMERIC_FIELDS: &[NumericField] = &[
    NumericField {
        pattern: &GFR_RE,
        assign: |data, value| data.gfr = Some(value),
    },
    NumericField {
        pattern: &CREATININE_RE,
        assign: |data, value| data.creatinine = Some(value),
    },
    NumericField {
        pattern: &BUN_RE,
        assign: |data, value| data.bun = Some(value),
    },
    NumericField {
        pattern: &PROTEINURIA_RE,
        assign: |data, value| data.proteinuria = Some(value),
    },
];

/// Parse structured clinical values out of free text. Each field is an
/// independent pattern search; a non-match (or a match whose number fails to
/// parse) leaves the field unset rather than raising an error. Units are
/// trusted as given, no normalization.
pub fn extract_clinical_data(text: &str, knowledge: &KnowledgeBase) -> ClinicalData {
    let mut data = ClinicalData::default();

    for field in NUMERIC_FIELDS {
        if let Some(caps) = field.pattern.captures(text) {
            if let Some(value) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
                (field.assign)(&mut data, value);
            }
        }
    }

    if let Some(caps) = BLOOD_PRESSURE_RE.captures(text) {
        let systolic = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok());
        let diastolic = caps.get(2).and_then(|m| m.as_str().parse::<u16>().ok());
        if let (Some(systolic), Some(diastolic)) = (systolic, diastolic) {
            data.blood_pressure = Some(BloodPressure { systolic, diastolic });
        }
    }

    data.diabetes = DIABETES_RE.is_match(text);

    let lowered = text.to_lowercase();
    for entry in &knowledge.complications {
        if lowered.contains(&entry.name.to_lowercase()) {
            data.complications.push(entry.clone());
        }
    }

    data
}
