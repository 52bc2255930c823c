//! Revocation and per-user lookups.

use crate::error::{ApiError, ApiResult};
use crate::models::{
    RevokeSessionsRequest, RevokeSessionsResponse, Status, UserSessionHandlesRequest,
    UserSessionHandlesResponse,
};
use crate::{AppState, RequestContext};

/// `revoke`: by explicit handles, or every session of a user.
pub async fn revoke_sessions_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: RevokeSessionsRequest,
) -> ApiResult<RevokeSessionsResponse> {
    let revoked = match (body.session_handles, body.user_id) {
        (Some(handles), None) => state.engine.revoke_sessions(&ctx.scope, &handles).await?,
        (None, Some(user_id)) => {
            state
                .engine
                .revoke_sessions_for_user(
                    &ctx.scope,
                    &user_id,
                    body.revoke_across_all_tenants.unwrap_or(false),
                )
                .await?
        }
        _ => {
            return Err(ApiError::Validation(
                "exactly one of sessionHandles or userId is required".into(),
            ));
        }
    };
    Ok(RevokeSessionsResponse {
        status: Status::Ok,
        session_handles_revoked: revoked,
    })
}

/// `sessions of user`: handles of every session a user holds.
pub async fn user_session_handles_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: UserSessionHandlesRequest,
) -> ApiResult<UserSessionHandlesResponse> {
    let handles = state
        .engine
        .get_all_session_handles_for_user(
            &ctx.scope,
            &body.user_id,
            body.fetch_across_all_tenants.unwrap_or(false),
        )
        .await?;
    Ok(UserSessionHandlesResponse {
        status: Status::Ok,
        session_handles: handles,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tessera_core::ApiVersion;

    use super::*;
    use crate::handlers::session::create_session_handler;
    use crate::handlers::test_support::{ctx, state};

    #[tokio::test]
    async fn revoke_by_user_then_by_handle_is_idempotent() {
        let state = state();
        let ctx = ctx(ApiVersion::LATEST);
        let created = create_session_handler(
            &state,
            &ctx,
            serde_json::from_value(json!({"userId": "user-1"})).unwrap(),
        )
        .await
        .unwrap();

        let listed = user_session_handles_handler(
            &state,
            &ctx,
            UserSessionHandlesRequest {
                user_id: "user-1".into(),
                fetch_across_all_tenants: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(listed.session_handles, vec![created.session.handle.clone()]);

        let by_user = revoke_sessions_handler(
            &state,
            &ctx,
            RevokeSessionsRequest {
                user_id: Some("user-1".into()),
                ..RevokeSessionsRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_user.session_handles_revoked, vec![created.session.handle.clone()]);

        let again = revoke_sessions_handler(
            &state,
            &ctx,
            RevokeSessionsRequest {
                session_handles: Some(vec![created.session.handle]),
                ..RevokeSessionsRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(again.status, Status::Ok);
        assert!(again.session_handles_revoked.is_empty());
    }

    #[tokio::test]
    async fn revoke_needs_exactly_one_selector() {
        let state = state();
        let ctx = ctx(ApiVersion::LATEST);
        let err = revoke_sessions_handler(&state, &ctx, RevokeSessionsRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
