//! Request handlers.

pub mod keys;
pub mod revoke;
pub mod session;
pub mod session_data;

use tessera_core::SessionError;

use crate::error::ApiResult;
use crate::models::StatusMessage;

/// Turn the engine's recoverable outcomes into response statuses; anything
/// else stays an error.
pub(crate) fn status_message(e: SessionError) -> ApiResult<StatusMessage> {
    match e {
        SessionError::Unauthorised(m) => Ok(StatusMessage::unauthorised(m)),
        SessionError::TokenTheftDetected { session_handle, .. } => Ok(StatusMessage::unauthorised(
            format!("token theft detected for session {session_handle}"),
        )),
        SessionError::TryRefreshToken(m) => Ok(StatusMessage::try_refresh_token(m)),
        other => Err(other.into()),
    }
}
