use sha2::{Digest, Sha256};
use uuid::Uuid;

const DIGEST_SCHEME: &str = "s2";

/// Default student password: department digits of the roll plus "@1234".
pub fn default_student_password(roll: &str) -> String {
    match roll.get(6..9) {
        Some(dept) => format!("{}@1234", dept),
        None => "default@1234".to_string(),
    }
}

/// Lower-cased last three characters of the roll; the household half of
/// the parent username.
pub fn parent_suffix(roll: &str) -> String {
    let start = roll.len().saturating_sub(3);
    roll.get(start..).unwrap_or("").to_ascii_lowercase()
}

pub fn default_parent_username(roll: &str) -> String {
    format!("parent@{}", parent_suffix(roll))
}

pub fn default_parent_password(roll: &str) -> String {
    if roll.len() >= 3 {
        let start = roll.len() - 3;
        format!("parent@{}1234", roll.get(start..).unwrap_or(""))
    } else {
        "parent@0001234".to_string()
    }
}

/// Extracts the roll suffix from a typed parent identifier. The identifier
/// must carry the parent@ prefix; anything else resolves to no account.
pub fn parent_id_suffix(input: &str) -> Option<String> {
    let normalized = input.trim().to_ascii_lowercase();
    normalized
        .strip_prefix("parent@")
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn digest_hex(salt: &str, plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"$");
    hasher.update(plain.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn hash_password(plain: &str) -> String {
    let salt = Uuid::new_v4().to_string();
    format!("{}${}${}", DIGEST_SCHEME, salt, digest_hex(&salt, plain))
}

/// Accepts the salted-digest form written by this store, or bare plaintext
/// equality for records carried over from the offline store.
pub fn verify_password(stored: &str, candidate: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(salt), Some(hex)) if scheme == DIGEST_SCHEME => {
            digest_hex(salt, candidate) == hex
        }
        _ => stored == candidate,
    }
}
