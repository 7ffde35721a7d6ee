use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::debug;
use ulid::Ulid;

use crate::observability;

/// The login user name of a connection is the id of the clinician acting
/// through it. Anything else is refused with `28000`.
pub fn clinician_from_user(user: Option<&str>) -> PgWireResult<Ulid> {
    let user = user.unwrap_or_default();
    Ulid::from_string(user).map_err(|_| {
        metrics::counter!(observability::AUTH_FAILURES_TOTAL, "reason" => "caller").increment(1);
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "FATAL".into(),
            "28000".into(),
            format!("user name must be a clinician ULID, got {user:?}"),
        )))
    })
}

/// Shared practice password over cleartext auth. A login whose user name is
/// not a clinician id fails before the password is even compared.
#[derive(Debug)]
pub struct CareSchedAuthSource {
    password: String,
}

impl CareSchedAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CareSchedAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let clinician = clinician_from_user(login.user())?;
        debug!(
            "clinician {clinician} logging into practice {:?} from {}",
            login.database().unwrap_or("default"),
            login.host()
        );
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
