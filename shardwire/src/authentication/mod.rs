//! Pluggable credential exchange.
//!
//! Authentication only happens when a server answers STARTUP with
//! AUTHENTICATE. The connection then asks the configured
//! [`AuthenticatorProvider`] for an initial token and a session, and keeps
//! feeding server challenges to that session until the server reports success.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Type to represent an authentication error message.
pub type AuthError = String;

/// One credential exchange on one connection.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Answers an AUTH_CHALLENGE. The token format is specific to the
    /// authenticator the server uses; it may be absent.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called once on AUTH_SUCCESS with the final token, if any.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Creates an [`AuthenticatorSession`] for every connection that needs one.
///
/// Set it with `SessionBuilder::authenticator_provider`, or use
/// `SessionBuilder::user(name, password)` for [`PlainTextAuthenticator`].
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the initial AUTH_RESPONSE token and the session that will
    /// handle the rest of the exchange.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during PlainTextAuthentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username and password authentication, sent as a single SASL PLAIN token.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }

    fn initial_token(&self) -> Vec<u8> {
        let mut token = BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        token.put_u8(0);
        token.put_slice(self.username.as_bytes());
        token.put_u8(0);
        token.put_slice(self.password.as_bytes());
        token.to_vec()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_token()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_token_layout() {
        let auth = PlainTextAuthenticator::new("cassandra", "secret");
        let (token, mut session) = auth
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();
        assert_eq!(token.unwrap(), b"\0cassandra\0secret".to_vec());
        assert!(session.evaluate_challenge(None).await.is_err());
        assert!(session.success(None).await.is_ok());
        assert!(!format!("{:?}", auth).contains("secret"));
    }
}
