use std::fmt;

use crate::error::SubmitError;
use crate::prompt::Operator;

/// Environment variable through which the password reaches the Webin-CLI
/// child process (`-passwordEnv`). It is set on the child only.
pub const PASSWORD_ENV: &str = "KIRA_WEBIN_PASSWORD";

/// Webin account credential for one run. Obtained once, handed by reference
/// to every service call and dropped at process end. It cannot be printed or
/// serialized.
pub struct Credential {
    username: String,
    secret: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Result<Self, SubmitError> {
        let username = username.into().trim().to_string();
        let secret = secret.into();
        if username.is_empty() {
            return Err(SubmitError::Credential("Webin username is empty".to_string()));
        }
        if secret.is_empty() {
            return Err(SubmitError::Credential("password is empty".to_string()));
        }
        Ok(Self { username, secret })
    }

    /// Ask the operator for the password of `username`.
    pub fn acquire(operator: &dyn Operator, username: Option<&str>) -> Result<Self, SubmitError> {
        let username = match username {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => {
                return Err(SubmitError::Credential(
                    "no Webin username (use --username or webin.username in kira-submit.json)"
                        .to_string(),
                ));
            }
        };
        let secret = operator.read_secret(&format!("Webin password for {username}: "))?;
        Self::new(username, secret)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"****")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::prompt::ConfirmRequest;

    struct FixedOperator(&'static str);

    impl Operator for FixedOperator {
        fn read_secret(&self, _prompt: &str) -> Result<String, SubmitError> {
            Ok(self.0.to_string())
        }

        fn confirm(&self, _request: &ConfirmRequest) -> Result<bool, SubmitError> {
            Ok(false)
        }
    }

    #[test]
    fn debug_never_shows_secret() {
        let credential = Credential::new("Webin-12345", "hunter2").unwrap();
        let shown = format!("{credential:?}");
        assert!(shown.contains("Webin-12345"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn empty_password_is_a_credential_error() {
        let err = Credential::acquire(&FixedOperator(""), Some("Webin-1")).unwrap_err();
        assert_matches!(err, SubmitError::Credential(_));
    }

    #[test]
    fn missing_username_is_a_credential_error() {
        let err = Credential::acquire(&FixedOperator("pw"), None).unwrap_err();
        assert_matches!(err, SubmitError::Credential(_));
    }
}
