use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use crate::account::dto::RegisterDto;

const ALLOWED_USER_NAME_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._@+";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Password rules applied when an account is created.
#[derive(Debug, Clone)]
pub struct PasswordOptions {
    pub required_length: usize,
    pub required_unique_chars: usize,
    pub require_non_alphanumeric: bool,
    pub require_lowercase: bool,
    pub require_uppercase: bool,
    pub require_digit: bool,
}

impl Default for PasswordOptions {
    fn default() -> Self {
        Self {
            required_length: 6,
            required_unique_chars: 1,
            require_non_alphanumeric: true,
            require_lowercase: true,
            require_uppercase: true,
            require_digit: true,
        }
    }
}

impl PasswordOptions {
    /// Every rule the password breaks, in a stable order.
    pub fn violations(&self, password: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if password.chars().count() < self.required_length {
            errors.push(format!(
                "Passwords must be at least {} characters.",
                self.required_length
            ));
        }
        if self.require_non_alphanumeric && password.chars().all(|c| c.is_ascii_alphanumeric()) {
            errors.push("Passwords must have at least one non alphanumeric character.".into());
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push("Passwords must have at least one digit ('0'-'9').".into());
        }
        if self.require_lowercase && !password.chars().any(|c| c.is_ascii_lowercase()) {
            errors.push("Passwords must have at least one lowercase ('a'-'z').".into());
        }
        if self.require_uppercase && !password.chars().any(|c| c.is_ascii_uppercase()) {
            errors.push("Passwords must have at least one uppercase ('A'-'Z').".into());
        }
        let unique = password.chars().collect::<HashSet<_>>().len();
        if unique < self.required_unique_chars {
            errors.push(format!(
                "Passwords must use at least {} different characters.",
                self.required_unique_chars
            ));
        }
        errors
    }
}

pub(crate) fn is_valid_user_name(user_name: &str) -> bool {
    !user_name.is_empty() && user_name.chars().all(|c| ALLOWED_USER_NAME_CHARS.contains(c))
}

/// Shape checks on the request body: required fields and email format.
pub fn validate_register_request(dto: &RegisterDto) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    for (field, value) in [
        ("UserName", &dto.user_name),
        ("Email", &dto.email),
        ("Password", &dto.password),
        ("DisplayName", &dto.display_name),
    ] {
        if value.trim().is_empty() {
            errors.push(format!("The {field} field is required."));
        }
    }
    if !dto.email.trim().is_empty() && !is_valid_email(dto.email.trim()) {
        errors.push("The Email field is not a valid e-mail address.".into());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Rules checked when the account is created: user name characters and
/// password strength.
pub fn identity_violations(dto: &RegisterDto, options: &PasswordOptions) -> Vec<String> {
    let mut errors = Vec::new();
    let user_name = dto.user_name.trim();
    if !is_valid_user_name(user_name) {
        errors.push(format!(
            "Username '{user_name}' is invalid, can only contain letters or digits."
        ));
    }
    errors.extend(options.violations(&dto.password));
    errors
}
