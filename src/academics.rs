use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const SEMESTERS: [&str; 8] = [
    "sem1", "sem2", "sem3", "sem4", "sem5", "sem6", "sem7", "sem8",
];

pub const PASSED_OUT: &str = "Passed Out";
pub const PASS_MARK: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
pub struct Department {
    pub code: &'static str,
    pub name: &'static str,
    pub short_name: &'static str,
}

pub const DEPARTMENTS: [Department; 5] = [
    Department {
        code: "100",
        name: "AI & Data Science",
        short_name: "AI&DS",
    },
    Department {
        code: "101",
        name: "Cyber Security",
        short_name: "CS",
    },
    Department {
        code: "102",
        name: "Computer Science",
        short_name: "CSE",
    },
    Department {
        code: "103",
        name: "Electronics/VLSI",
        short_name: "VLSI",
    },
    Department {
        code: "104",
        name: "Electronics & Comm.",
        short_name: "ECE",
    },
];

pub fn department_by_code(code: &str) -> Option<&'static Department> {
    DEPARTMENTS.iter().find(|d| d.code == code)
}

pub fn department_label(dept: &Department) -> String {
    format!("{} ({})", dept.name, dept.short_name)
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RuleError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }
}

pub fn normalize_name(raw: &str) -> Result<String, RuleError> {
    let name = raw.trim().to_uppercase();
    if name.chars().count() < 2 {
        return Err(RuleError::new(
            "validation_failed",
            "name must be at least 2 characters",
        ));
    }
    Ok(name)
}

/// Department digits of a roll number: characters 7-9.
pub fn roll_dept_code(roll: &str) -> Option<&str> {
    roll.get(6..9)
}

/// Enrollment year digits of a roll number: the first two characters.
pub fn roll_enrollment_yy(roll: &str) -> Option<i64> {
    roll.get(0..2).and_then(|s| s.parse::<i64>().ok())
}

pub fn validate_roll(roll: &str, dept_code: &str) -> Result<(), RuleError> {
    if roll.len() != 12 || !roll.chars().all(|c| c.is_ascii_digit()) {
        return Err(RuleError::new(
            "validation_failed",
            "roll number must be exactly 12 digits",
        ));
    }
    let roll_dept = roll_dept_code(roll).unwrap_or("");
    if roll_dept != dept_code {
        return Err(RuleError {
            code: "validation_failed",
            message: format!(
                "department code in roll number ({}) does not match the selected department ({})",
                roll_dept, dept_code
            ),
            details: Some(json!({
                "rollDeptCode": roll_dept,
                "selectedDeptCode": dept_code
            })),
        });
    }
    Ok(())
}

pub fn validate_academic_year(roll: &str, declared: &str, today: NaiveDate) -> Result<(), RuleError> {
    if declared == PASSED_OUT {
        return Ok(());
    }
    let declared_num = match declared.parse::<i64>() {
        Ok(v) if (1..=4).contains(&v) => v,
        _ => {
            return Err(RuleError::new(
                "validation_failed",
                "year must be one of 1-4 or Passed Out",
            ))
        }
    };
    let enroll_yy = roll_enrollment_yy(roll).unwrap_or(0);
    let curr_yy = (today.year() % 100) as i64;
    let expected_max = (curr_yy - enroll_yy + 1).clamp(1, 4);
    if declared_num > expected_max {
        return Err(RuleError {
            code: "validation_failed",
            message: format!(
                "enrollment year in the roll number allows at most academic year {}",
                expected_max
            ),
            details: Some(json!({
                "declaredYear": declared_num,
                "expectedMaxYear": expected_max
            })),
        });
    }
    Ok(())
}

/// Semester the student sits in on `today`. Odd semesters run from
/// September, even semesters from January; "Passed Out" pins to 8.
pub fn current_semester(roll: &str, declared_year: &str, today: NaiveDate) -> i64 {
    if declared_year == PASSED_OUT {
        return 8;
    }
    let enroll_yy = roll_enrollment_yy(roll).unwrap_or(0);
    let curr_yy = (today.year() % 100) as i64;
    let mut active_year = curr_yy - enroll_yy + 1;
    if active_year > 4 {
        active_year = 4;
    }
    let sem = if today.month() >= 9 {
        active_year * 2 - 1
    } else {
        active_year * 2
    };
    sem.clamp(1, 8)
}

pub fn semester_key(n: i64) -> String {
    format!("sem{}", n)
}

pub fn validate_semester_key(sem: &str) -> Result<(), RuleError> {
    if SEMESTERS.contains(&sem) {
        return Ok(());
    }
    Err(RuleError {
        code: "validation_failed",
        message: format!("semester must be one of sem1..sem8, got {}", sem),
        details: Some(json!({ "semester": sem })),
    })
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SemesterMarks {
    pub int1: Option<i64>,
    pub int2: Option<i64>,
    pub model: Option<i64>,
    pub sem_final: Option<i64>,
    pub assignment: Option<i64>,
    pub mini_project: Option<i64>,
    pub rmk_next_gen: Option<i64>,
}

const MARK_BOUNDS: [(&str, i64); 7] = [
    ("int1", 100),
    ("int2", 100),
    ("model", 100),
    ("semFinal", 100),
    ("assignment", 10),
    ("miniProject", 5),
    ("rmkNextGen", 10),
];

impl SemesterMarks {
    fn component(&self, field: &str) -> Option<i64> {
        match field {
            "int1" => self.int1,
            "int2" => self.int2,
            "model" => self.model,
            "semFinal" => self.sem_final,
            "assignment" => self.assignment,
            "miniProject" => self.mini_project,
            "rmkNextGen" => self.rmk_next_gen,
            _ => None,
        }
    }
}

/// Every present component must sit inside its bound; one violation
/// rejects the whole submission.
pub fn validate_marks(marks: &SemesterMarks) -> Result<(), RuleError> {
    for (field, max) in MARK_BOUNDS {
        let Some(value) = marks.component(field) else {
            continue;
        };
        if value < 0 || value > max {
            return Err(RuleError {
                code: "validation_failed",
                message: format!("{} must be between 0 and {}", field, max),
                details: Some(json!({
                    "field": field,
                    "max": max,
                    "value": value
                })),
            });
        }
    }
    Ok(())
}

/// Composite semester score out of 100, or None while the gating marks
/// (int1, semFinal) are absent. Other absent components count as 0:
/// internal theory mean scaled to 25, activities added raw (max 25),
/// final exam scaled to 50.
pub fn total_score(marks: &SemesterMarks) -> Option<f64> {
    let int1 = marks.int1?;
    let sem_final = marks.sem_final?;
    let avg_internal =
        (int1 + marks.int2.unwrap_or(0) + marks.model.unwrap_or(0)) as f64 / 3.0;
    let activities = (marks.assignment.unwrap_or(0)
        + marks.mini_project.unwrap_or(0)
        + marks.rmk_next_gen.unwrap_or(0)) as f64;
    Some(avg_internal / 100.0 * 25.0 + activities + sem_final as f64 / 100.0 * 50.0)
}

pub fn validate_attendance(total_days: i64, days_present: i64) -> Result<(), RuleError> {
    if total_days < 0 || days_present < 0 {
        return Err(RuleError::new(
            "validation_failed",
            "attendance counts must not be negative",
        ));
    }
    if days_present > total_days {
        return Err(RuleError::new(
            "validation_failed",
            "days present cannot exceed total days",
        ));
    }
    Ok(())
}

pub fn attendance_percent(total_days: i64, days_present: i64) -> f64 {
    if total_days > 0 {
        days_present as f64 / total_days as f64 * 100.0
    } else {
        0.0
    }
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
