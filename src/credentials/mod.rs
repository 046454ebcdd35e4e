//! Portal login credentials.
//!
//! The password is a [`SecretString`]; it is exposed only while the
//! credential postback is built and never reaches logs or `Debug` output.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Username/password pair for one tenant's portal account.
#[derive(Clone)]
pub struct PortalCredentials {
    username: String,
    password: SecretString,
}

impl PortalCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}
