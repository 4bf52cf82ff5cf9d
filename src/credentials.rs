//! Login credentials and the secrets file they are loaded from.
//!
//! A secrets file is a small TOML document with a username and either a
//! password or a base64 encoded reusable credential blob:
//!
//! ```toml
//! username = "alice"
//! password = "correct horse battery staple"
//! ```
//!
//! ```toml
//! username = "alice"
//! auth_data = "AQID..."
//! ```

use std::{fs, path::Path};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use veil::Redact;

use crate::{
    error::{Error, Result},
    protocol::protos::authentication::AuthenticationType,
};

/// Largest secrets file that will be read.
const MAX_SECRETS_SIZE: u64 = 4096;

/// How the authentication payload is to be interpreted by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthType {
    /// A plaintext password.
    Password,

    /// A reusable credential blob handed out by a previous login.
    StoredCredentials,

    /// An OAuth access token.
    Token,
}

impl From<AuthType> for AuthenticationType {
    fn from(auth_type: AuthType) -> Self {
        match auth_type {
            AuthType::Password => Self::AUTHENTICATION_USER_PASS,
            AuthType::StoredCredentials => Self::AUTHENTICATION_STORED_SPOTIFY_CREDENTIALS,
            AuthType::Token => Self::AUTHENTICATION_SPOTIFY_TOKEN,
        }
    }
}

impl TryFrom<AuthenticationType> for AuthType {
    type Error = Error;

    fn try_from(value: AuthenticationType) -> Result<Self> {
        match value {
            AuthenticationType::AUTHENTICATION_USER_PASS => Ok(Self::Password),
            AuthenticationType::AUTHENTICATION_STORED_SPOTIFY_CREDENTIALS => {
                Ok(Self::StoredCredentials)
            }
            AuthenticationType::AUTHENTICATION_SPOTIFY_TOKEN => Ok(Self::Token),
            other => Err(Error::invalid_argument(format!(
                "unsupported authentication type {other:?}"
            ))),
        }
    }
}

/// Identity presented at login. Immutable once constructed.
#[derive(Clone, PartialEq, Eq, Hash, Redact)]
pub struct Credentials {
    pub username: String,
    pub auth_type: AuthType,
    #[redact]
    pub auth_data: Vec<u8>,
}

#[derive(Deserialize)]
struct SecretsFile {
    username: String,
    password: Option<String>,
    auth_data: Option<String>,
}

impl Credentials {
    #[must_use]
    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth_type: AuthType::Password,
            auth_data: password.into().into_bytes(),
        }
    }

    #[must_use]
    pub fn with_stored(username: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            username: username.into(),
            auth_type: AuthType::StoredCredentials,
            auth_data: blob,
        }
    }

    #[must_use]
    pub fn with_token(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth_type: AuthType::Token,
            auth_data: token.into().into_bytes(),
        }
    }

    /// Loads credentials from a TOML secrets file.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` when the file is too large, is not valid TOML,
    ///   or has neither or both of `password` and `auth_data`
    /// * `DataLoss` when `auth_data` is not valid base64
    /// * any I/O error reading the file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: secrets files are small.
        let size = fs::metadata(path)?.len();
        if size > MAX_SECRETS_SIZE {
            return Err(Error::invalid_argument(format!(
                "{} is too large",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let secrets: SecretsFile = toml::from_str(&contents)?;
        if secrets.username.is_empty() {
            return Err(Error::invalid_argument(format!(
                "{} does not contain a username",
                path.display()
            )));
        }

        match (secrets.password, secrets.auth_data) {
            (Some(password), None) => Ok(Self::with_password(secrets.username, password)),
            (None, Some(blob)) => Ok(Self::with_stored(
                secrets.username,
                BASE64.decode(blob.trim())?,
            )),
            _ => Err(Error::invalid_argument(format!(
                "{} should contain either a password or auth_data",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::ErrorKind;

    fn secrets(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_password_credentials() {
        let file = secrets("username = \"alice\"\npassword = \"hunter2\"\n");
        let credentials = Credentials::from_file(file.path()).unwrap();

        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.auth_type, AuthType::Password);
        assert_eq!(credentials.auth_data, b"hunter2");
    }

    #[test]
    fn loads_stored_credentials() {
        let file = secrets("username = \"alice\"\nauth_data = \"AQID\"\n");
        let credentials = Credentials::from_file(file.path()).unwrap();

        assert_eq!(credentials.auth_type, AuthType::StoredCredentials);
        assert_eq!(credentials.auth_data, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_ambiguous_or_oversized_files() {
        let both = secrets("username = \"alice\"\npassword = \"x\"\nauth_data = \"AQID\"\n");
        assert_eq!(
            Credentials::from_file(both.path()).unwrap_err().kind,
            ErrorKind::InvalidArgument
        );

        let neither = secrets("username = \"alice\"\n");
        assert_eq!(
            Credentials::from_file(neither.path()).unwrap_err().kind,
            ErrorKind::InvalidArgument
        );

        let large = secrets(&format!("username = \"{}\"\n", "a".repeat(5000)));
        assert_eq!(
            Credentials::from_file(large.path()).unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn debug_output_hides_the_secret() {
        let credentials = Credentials::with_password("alice", "hunter2");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("104, 117, 110"));
    }
}
