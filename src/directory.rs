use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;

use crate::credentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    None,
    Requested,
    Approved,
}

impl ResetState {
    pub fn as_str(self) -> &'static str {
        match self {
            ResetState::None => "none",
            ResetState::Requested => "requested",
            ResetState::Approved => "approved",
        }
    }

    /// Legacy stores wrote 'true'/'false' here; treat 'true' as a live
    /// request so an unmigrated row still fails closed.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "requested" | "true" => ResetState::Requested,
            "approved" => ResetState::Approved,
            _ => ResetState::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudentAccount {
    pub roll: String,
    pub name: String,
    pub password: String,
    pub reset_state: ResetState,
}

#[derive(Debug, Clone)]
pub struct StaffAccount {
    pub username: String,
    pub role: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct DirectoryError {
    pub code: &'static str,
    pub message: String,
}

impl DirectoryError {
    fn query(message: impl Into<String>) -> Self {
        Self {
            code: "db_query_failed",
            message: message.into(),
        }
    }

    fn update(message: impl Into<String>) -> Self {
        Self {
            code: "db_update_failed",
            message: message.into(),
        }
    }
}

/// The account-access seam the credential flows run against. The daemon
/// uses the SQLite store; the in-memory store mirrors the offline record
/// shape and backs the flow unit tests.
pub trait Directory {
    fn staff_by_username(&self, username: &str) -> Result<Option<StaffAccount>, DirectoryError>;
    fn student_by_roll(&self, roll: &str) -> Result<Option<StudentAccount>, DirectoryError>;
    fn student_by_parent_suffix(
        &self,
        suffix: &str,
    ) -> Result<Option<StudentAccount>, DirectoryError>;
    fn set_staff_password(&mut self, username: &str, stored: &str) -> Result<(), DirectoryError>;
    fn set_student_password(&mut self, roll: &str, stored: &str) -> Result<(), DirectoryError>;
    fn set_reset_state(&mut self, roll: &str, state: ResetState) -> Result<(), DirectoryError>;
    fn students_with_reset_requested(&self) -> Result<Vec<(String, String)>, DirectoryError>;
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    staff: BTreeMap<String, StaffAccount>,
    students: BTreeMap<String, StudentAccount>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_staff(&mut self, username: &str, password: &str) {
        let uname = username.to_ascii_uppercase();
        self.staff.insert(
            uname.clone(),
            StaffAccount {
                username: uname,
                role: "staff".to_string(),
                password: password.to_string(),
            },
        );
    }

    /// Seeds the account the way the offline store does: plaintext default
    /// password, no pending reset.
    pub fn insert_student(&mut self, roll: &str, name: &str) {
        self.students.insert(
            roll.to_string(),
            StudentAccount {
                roll: roll.to_string(),
                name: name.to_string(),
                password: credentials::default_student_password(roll),
                reset_state: ResetState::None,
            },
        );
    }
}

impl Directory for MemoryDirectory {
    fn staff_by_username(&self, username: &str) -> Result<Option<StaffAccount>, DirectoryError> {
        Ok(self.staff.get(&username.to_ascii_uppercase()).cloned())
    }

    fn student_by_roll(&self, roll: &str) -> Result<Option<StudentAccount>, DirectoryError> {
        Ok(self.students.get(roll).cloned())
    }

    fn student_by_parent_suffix(
        &self,
        suffix: &str,
    ) -> Result<Option<StudentAccount>, DirectoryError> {
        Ok(self
            .students
            .values()
            .find(|s| credentials::parent_suffix(&s.roll) == suffix)
            .cloned())
    }

    fn set_staff_password(&mut self, username: &str, stored: &str) -> Result<(), DirectoryError> {
        if let Some(acc) = self.staff.get_mut(&username.to_ascii_uppercase()) {
            acc.password = stored.to_string();
        }
        Ok(())
    }

    fn set_student_password(&mut self, roll: &str, stored: &str) -> Result<(), DirectoryError> {
        if let Some(acc) = self.students.get_mut(roll) {
            acc.password = stored.to_string();
        }
        Ok(())
    }

    fn set_reset_state(&mut self, roll: &str, state: ResetState) -> Result<(), DirectoryError> {
        if let Some(acc) = self.students.get_mut(roll) {
            acc.reset_state = state;
        }
        Ok(())
    }

    fn students_with_reset_requested(&self) -> Result<Vec<(String, String)>, DirectoryError> {
        Ok(self
            .students
            .values()
            .filter(|s| s.reset_state == ResetState::Requested)
            .map(|s| (s.roll.clone(), s.name.clone()))
            .collect())
    }
}

pub struct SqliteDirectory<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteDirectory<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl Directory for SqliteDirectory<'_> {
    fn staff_by_username(&self, username: &str) -> Result<Option<StaffAccount>, DirectoryError> {
        self.conn
            .query_row(
                "SELECT username, role, password FROM users WHERE username = ?",
                [&username.to_ascii_uppercase()],
                |r| {
                    Ok(StaffAccount {
                        username: r.get(0)?,
                        role: r.get(1)?,
                        password: r.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| DirectoryError::query(e.to_string()))
    }

    fn student_by_roll(&self, roll: &str) -> Result<Option<StudentAccount>, DirectoryError> {
        self.conn
            .query_row(
                "SELECT roll, name, password, reset_state FROM students WHERE roll = ?",
                [roll],
                |r| {
                    let state: String = r.get(3)?;
                    Ok(StudentAccount {
                        roll: r.get(0)?,
                        name: r.get(1)?,
                        password: r.get(2)?,
                        reset_state: ResetState::parse(&state),
                    })
                },
            )
            .optional()
            .map_err(|e| DirectoryError::query(e.to_string()))
    }

    fn student_by_parent_suffix(
        &self,
        suffix: &str,
    ) -> Result<Option<StudentAccount>, DirectoryError> {
        // First match in roll order keeps suffix collisions deterministic.
        self.conn
            .query_row(
                "SELECT roll, name, password, reset_state FROM students
                 WHERE lower(substr(roll, -3, 3)) = ?
                 ORDER BY roll LIMIT 1",
                [suffix],
                |r| {
                    let state: String = r.get(3)?;
                    Ok(StudentAccount {
                        roll: r.get(0)?,
                        name: r.get(1)?,
                        password: r.get(2)?,
                        reset_state: ResetState::parse(&state),
                    })
                },
            )
            .optional()
            .map_err(|e| DirectoryError::query(e.to_string()))
    }

    fn set_staff_password(&mut self, username: &str, stored: &str) -> Result<(), DirectoryError> {
        self.conn
            .execute(
                "UPDATE users SET password = ? WHERE username = ?",
                (stored, &username.to_ascii_uppercase()),
            )
            .map_err(|e| DirectoryError::update(e.to_string()))?;
        Ok(())
    }

    fn set_student_password(&mut self, roll: &str, stored: &str) -> Result<(), DirectoryError> {
        self.conn
            .execute(
                "UPDATE students
                 SET password = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE roll = ?",
                (stored, roll),
            )
            .map_err(|e| DirectoryError::update(e.to_string()))?;
        Ok(())
    }

    fn set_reset_state(&mut self, roll: &str, state: ResetState) -> Result<(), DirectoryError> {
        self.conn
            .execute(
                "UPDATE students
                 SET reset_state = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE roll = ?",
                (state.as_str(), roll),
            )
            .map_err(|e| DirectoryError::update(e.to_string()))?;
        Ok(())
    }

    fn students_with_reset_requested(&self) -> Result<Vec<(String, String)>, DirectoryError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT roll, name FROM students WHERE reset_state = 'requested' ORDER BY roll",
            )
            .map_err(|e| DirectoryError::query(e.to_string()))?;
        stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| DirectoryError::query(e.to_string()))
    }
}
