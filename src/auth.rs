use crate::credentials;
use crate::directory::{Directory, DirectoryError, ResetState, StudentAccount};

pub const STAFF_DISPLAY_NAME: &str = "ADMINISTRATOR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    Staff,
    Student,
    Parent,
}

impl UserType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "staff" => Some(UserType::Staff),
            "student" => Some(UserType::Student),
            "parent" => Some(UserType::Parent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserType::Staff => "staff",
            UserType::Student => "student",
            UserType::Parent => "parent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<DirectoryError> for AuthError {
    fn from(e: DirectoryError) -> Self {
        AuthError {
            code: e.code,
            message: e.message,
        }
    }
}

/// The authenticated caller, as carried by a verified token. Operations
/// take it explicitly; there is no ambient session.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub subject: String,
    pub display_name: String,
    pub role: &'static str,
}

pub fn login<D: Directory>(
    dir: &mut D,
    user_type: UserType,
    username: &str,
    password: &str,
) -> Result<LoginOutcome, AuthError> {
    match user_type {
        UserType::Staff => login_staff(dir, username, password),
        UserType::Student => {
            let roll = username.trim().to_ascii_uppercase();
            let student = dir
                .student_by_roll(&roll)?
                .ok_or_else(|| AuthError::new("not_found", "user id not found"))?;
            finish_household_login(dir, UserType::Student, student, password)
        }
        UserType::Parent => {
            let suffix = credentials::parent_id_suffix(username)
                .ok_or_else(|| AuthError::new("not_found", "user id not found"))?;
            let student = dir
                .student_by_parent_suffix(&suffix)?
                .ok_or_else(|| AuthError::new("not_found", "user id not found"))?;
            finish_household_login(dir, UserType::Parent, student, password)
        }
    }
}

fn login_staff<D: Directory>(
    dir: &mut D,
    username: &str,
    password: &str,
) -> Result<LoginOutcome, AuthError> {
    let staff = dir
        .staff_by_username(username.trim())?
        .ok_or_else(|| AuthError::new("not_found", "user id not found"))?;
    if !credentials::verify_password(&staff.password, password) {
        return Err(AuthError::new(
            "auth_failed",
            "invalid staff username or password",
        ));
    }
    Ok(LoginOutcome {
        subject: staff.username,
        display_name: STAFF_DISPLAY_NAME.to_string(),
        role: UserType::Staff.as_str(),
    })
}

fn finish_household_login<D: Directory>(
    dir: &mut D,
    user_type: UserType,
    student: StudentAccount,
    password: &str,
) -> Result<LoginOutcome, AuthError> {
    if student.reset_state == ResetState::Requested {
        return Err(AuthError::new(
            "reset_pending",
            "login blocked while a password reset awaits approval",
        ));
    }

    let default_password = match user_type {
        UserType::Parent => credentials::default_parent_password(&student.roll),
        _ => credentials::default_student_password(&student.roll),
    };

    // Two acceptance branches: the stored credential (students only; a
    // parent has no stored credential of their own) and the derived
    // default for the role.
    let stored_ok = user_type == UserType::Student
        && credentials::verify_password(&student.password, password);
    let default_ok = password == default_password;

    if !stored_ok && !default_ok {
        return Err(AuthError::new("auth_failed", "invalid password"));
    }

    if default_ok && student.reset_state == ResetState::Approved {
        dir.set_reset_state(&student.roll, ResetState::None)?;
        if user_type == UserType::Student {
            dir.set_student_password(
                &student.roll,
                &credentials::hash_password(&default_password),
            )?;
        }
    }

    Ok(LoginOutcome {
        subject: student.roll,
        display_name: student.name,
        role: user_type.as_str(),
    })
}

/// Flags the account for staff approval. Further logins fail closed until
/// a staff member approves the reset.
pub fn request_reset<D: Directory>(
    dir: &mut D,
    user_type: UserType,
    username: &str,
) -> Result<String, AuthError> {
    let student = match user_type {
        UserType::Staff => {
            return Err(AuthError::new(
                "staff_reset_unsupported",
                "staff accounts are reset manually; contact system support",
            ))
        }
        UserType::Student => dir.student_by_roll(&username.trim().to_ascii_uppercase())?,
        UserType::Parent => match credentials::parent_id_suffix(username) {
            Some(suffix) => dir.student_by_parent_suffix(&suffix)?,
            None => None,
        },
    };
    let student = student.ok_or_else(|| AuthError::new("not_found", "user id not found"))?;
    dir.set_reset_state(&student.roll, ResetState::Requested)?;
    Ok(student.roll)
}

/// Staff approval: the stored password returns to the derived default and
/// the account unlocks on the next default-password login.
pub fn approve_reset<D: Directory>(dir: &mut D, roll: &str) -> Result<String, AuthError> {
    let student = dir
        .student_by_roll(roll)?
        .ok_or_else(|| AuthError::new("not_found", "student not found"))?;
    let default_password = credentials::default_student_password(&student.roll);
    dir.set_student_password(&student.roll, &credentials::hash_password(&default_password))?;
    dir.set_reset_state(&student.roll, ResetState::Approved)?;
    Ok(default_password)
}

pub fn change_password<D: Directory>(
    dir: &mut D,
    principal: &Principal,
    new_password: &str,
    confirm_password: &str,
) -> Result<(), AuthError> {
    if new_password != confirm_password {
        return Err(AuthError::new(
            "validation_failed",
            "new passwords do not match",
        ));
    }
    if new_password.len() < 6 {
        return Err(AuthError::new(
            "validation_failed",
            "password must be at least 6 characters",
        ));
    }

    match principal.role.as_str() {
        "staff" => {
            dir.staff_by_username(&principal.subject)?
                .ok_or_else(|| AuthError::new("not_found", "staff account not found"))?;
            dir.set_staff_password(&principal.subject, &credentials::hash_password(new_password))?;
            Ok(())
        }
        "student" => {
            let student = dir
                .student_by_roll(&principal.subject)?
                .ok_or_else(|| AuthError::new("not_found", "student not found"))?;
            dir.set_student_password(
                &student.roll,
                &credentials::hash_password(new_password),
            )?;
            dir.set_reset_state(&student.roll, ResetState::None)?;
            Ok(())
        }
        "parent" => Err(AuthError::new(
            "forbidden",
            "parent accounts cannot change the student password",
        )),
        _ => Err(AuthError::new("forbidden", "unknown role")),
    }
}
