//! Session lookup and stored-claim updates.

use super::status_message;
use crate::error::ApiResult;
use crate::models::{
    SessionDataResponse, SessionHandleRequest, SessionInformationDto,
    SessionInformationResponse, UpdateJwtDataRequest, UpdateSessionDataRequest,
};
use crate::{AppState, RequestContext};

/// `session info`: stored state of one session, from any tenant of its app.
pub async fn session_information_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: SessionHandleRequest,
) -> ApiResult<SessionInformationResponse> {
    match state
        .engine
        .get_session_information(&ctx.scope, &body.session_handle)
        .await
    {
        Ok(info) => Ok(SessionInformationResponse::Found(Box::new(
            SessionInformationDto::new(info, ctx.api_version.includes_tenant_id()),
        ))),
        Err(e) => Ok(SessionInformationResponse::Failed(status_message(e)?)),
    }
}

pub async fn get_session_data_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: SessionHandleRequest,
) -> ApiResult<SessionDataResponse> {
    match state
        .engine
        .get_session_data(&ctx.scope, &body.session_handle)
        .await
    {
        Ok(data) => Ok(SessionDataResponse {
            user_data_in_database: Some(data),
            ..SessionDataResponse::ok()
        }),
        Err(e) => Ok(SessionDataResponse::unauthorised(status_message(e)?.message)),
    }
}

pub async fn update_session_data_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: UpdateSessionDataRequest,
) -> ApiResult<SessionDataResponse> {
    match state
        .engine
        .update_session_data(&ctx.scope, &body.session_handle, body.user_data_in_database)
        .await
    {
        Ok(()) => Ok(SessionDataResponse::ok()),
        Err(e) => Ok(SessionDataResponse::unauthorised(status_message(e)?.message)),
    }
}

pub async fn get_jwt_data_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: SessionHandleRequest,
) -> ApiResult<SessionDataResponse> {
    match state
        .engine
        .get_jwt_data(&ctx.scope, &body.session_handle)
        .await
    {
        Ok(data) => Ok(SessionDataResponse {
            user_data_in_jwt: Some(data),
            ..SessionDataResponse::ok()
        }),
        Err(e) => Ok(SessionDataResponse::unauthorised(status_message(e)?.message)),
    }
}

/// Replace stored JWT claims; clients see them after their next refresh.
pub async fn update_jwt_data_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: UpdateJwtDataRequest,
) -> ApiResult<SessionDataResponse> {
    match state
        .engine
        .update_jwt_data(&ctx.scope, &body.session_handle, body.user_data_in_jwt)
        .await
    {
        Ok(()) => Ok(SessionDataResponse::ok()),
        Err(e) => Ok(SessionDataResponse::unauthorised(status_message(e)?.message)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tessera_core::ApiVersion;
    use tessera_core::store::Claims;

    use super::*;
    use crate::error::ApiError;
    use crate::handlers::session::create_session_handler;
    use crate::handlers::test_support::{ctx, state};
    use crate::models::Status;

    fn claims(value: serde_json::Value) -> Claims {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn information_and_data_round_trip_through_the_store() {
        let state = state();
        let ctx = ctx(ApiVersion::new(3, 0));
        let created = create_session_handler(
            &state,
            &ctx,
            serde_json::from_value(json!({
                "userId": "user-1",
                "userDataInDatabase": {"plan": "free"}
            }))
            .unwrap(),
        )
        .await
        .unwrap();
        let handle = created.session.handle.clone();

        let info = session_information_handler(
            &state,
            &ctx,
            SessionHandleRequest {
                session_handle: handle.clone(),
            },
        )
        .await
        .unwrap();
        match info {
            SessionInformationResponse::Found(found) => {
                assert_eq!(found.user_id, "user-1");
                assert_eq!(found.user_data_in_database, claims(json!({"plan": "free"})));
                // API 3.x responses carry no tenant.
                assert!(found.tenant_id.is_none());
            }
            other => panic!("expected session, got {other:?}"),
        }

        let updated = update_session_data_handler(
            &state,
            &ctx,
            UpdateSessionDataRequest {
                session_handle: handle.clone(),
                user_data_in_database: claims(json!({"plan": "pro"})),
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.status, Status::Ok);

        let data = get_session_data_handler(
            &state,
            &ctx,
            SessionHandleRequest {
                session_handle: handle,
            },
        )
        .await
        .unwrap();
        assert_eq!(data.user_data_in_database, Some(claims(json!({"plan": "pro"}))));
    }

    #[tokio::test]
    async fn unknown_handle_is_an_unauthorised_status() {
        let state = state();
        let ctx = ctx(ApiVersion::LATEST);
        let info = session_information_handler(
            &state,
            &ctx,
            SessionHandleRequest {
                session_handle: "missing".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            info,
            SessionInformationResponse::Failed(ref f) if f.status == Status::Unauthorised
        ));

        let data = get_jwt_data_handler(
            &state,
            &ctx,
            SessionHandleRequest {
                session_handle: "missing".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(data.status, Status::Unauthorised);
    }

    #[tokio::test]
    async fn protected_jwt_data_is_rejected() {
        let state = state();
        let ctx = ctx(ApiVersion::LATEST);
        let err = update_jwt_data_handler(
            &state,
            &ctx,
            UpdateJwtDataRequest {
                session_handle: "missing".into(),
                user_data_in_jwt: claims(json!({"tId": "other"})),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
