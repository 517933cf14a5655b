use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Single shared password for every login; the user name is informational only.
#[derive(Debug)]
pub struct BenbAuthSource {
    password: String,
}

impl BenbAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for BenbAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = login.user().unwrap_or("-"), "password lookup");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
