//! Create, verify, refresh and regenerate.

use tessera_core::session::{NewSession, SessionTokens};
use tracing::debug;

use super::status_message;
use crate::error::ApiResult;
use crate::models::{
    CreateSessionRequest, KeyDiscoveryDto, RefreshSessionRequest, RefreshSessionResponse,
    RegenerateSessionRequest, RegenerateSessionResponse, RegeneratedSession, SessionDto,
    SessionTokensResponse, Status, TokenDto, VerifySessionRequest, VerifySessionResponse,
};
use crate::{AppState, RequestContext};

/// Legacy signing-key fields, for callers that cannot use JWKS.
async fn signing_keys(
    state: &AppState,
    ctx: &RequestContext,
) -> ApiResult<Option<KeyDiscoveryDto>> {
    if !ctx.api_version.includes_signing_keys() {
        return Ok(None);
    }
    let discovery = state.engine.key_discovery(&ctx.scope).await?;
    Ok(Some(discovery.into()))
}

async fn tokens_response(
    state: &AppState,
    ctx: &RequestContext,
    tokens: SessionTokens,
) -> ApiResult<SessionTokensResponse> {
    Ok(SessionTokensResponse {
        status: Status::Ok,
        session: SessionDto::new(tokens.session, ctx.api_version.includes_tenant_id()),
        access_token: tokens.access_token.into(),
        refresh_token: tokens.refresh_token.into(),
        anti_csrf_token: tokens.anti_csrf_token,
        signing_keys: signing_keys(state, ctx).await?,
    })
}

/// `create`: start a session.
pub async fn create_session_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: CreateSessionRequest,
) -> ApiResult<SessionTokensResponse> {
    let tokens = state
        .engine
        .create_session(
            &ctx.scope,
            ctx.api_version,
            NewSession {
                user_id: body.user_id,
                user_data_in_jwt: body.user_data_in_jwt,
                user_data_in_database: body.user_data_in_database,
                enable_anti_csrf: body.enable_anti_csrf,
                use_static_key: body.use_static_key,
            },
        )
        .await?;
    tokens_response(state, ctx, tokens).await
}

/// `verify`: check an access token.
pub async fn verify_session_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: VerifySessionRequest,
) -> ApiResult<VerifySessionResponse> {
    let outcome = state
        .engine
        .verify_session(
            &ctx.scope,
            ctx.api_version,
            &body.access_token,
            body.anti_csrf_token.as_deref(),
            body.do_anti_csrf_check,
            body.check_database,
        )
        .await;
    let signing_keys = signing_keys(state, ctx).await?;

    match outcome {
        Ok(verified) => Ok(VerifySessionResponse {
            status: Status::Ok,
            session: Some(SessionDto::new(
                verified.session,
                ctx.api_version.includes_tenant_id(),
            )),
            access_token: verified.access_token.map(TokenDto::from),
            message: None,
            signing_keys,
        }),
        Err(e) => {
            let failed = status_message(e)?;
            debug!(status = ?failed.status, message = %failed.message, "access token rejected");
            Ok(VerifySessionResponse {
                status: failed.status,
                session: None,
                access_token: None,
                message: Some(failed.message),
                signing_keys,
            })
        }
    }
}

/// `refresh`: exchange a refresh token for a new pair.
pub async fn refresh_session_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: RefreshSessionRequest,
) -> ApiResult<RefreshSessionResponse> {
    let outcome = state
        .engine
        .refresh_session(
            &ctx.scope,
            ctx.api_version,
            &body.refresh_token,
            body.anti_csrf_token.as_deref(),
            body.enable_anti_csrf,
        )
        .await;
    match outcome {
        Ok(tokens) => Ok(RefreshSessionResponse::Refreshed(Box::new(
            tokens_response(state, ctx, tokens).await?,
        ))),
        Err(e) => Ok(RefreshSessionResponse::Failed(status_message(e)?)),
    }
}

/// `regenerate`: replace the JWT claims and re-issue the access token.
pub async fn regenerate_session_handler(
    state: &AppState,
    ctx: &RequestContext,
    body: RegenerateSessionRequest,
) -> ApiResult<RegenerateSessionResponse> {
    let outcome = state
        .engine
        .regenerate_session(
            &ctx.scope,
            ctx.api_version,
            &body.access_token,
            body.user_data_in_jwt,
        )
        .await;
    match outcome {
        Ok(regenerated) => Ok(RegenerateSessionResponse::Regenerated(RegeneratedSession {
            status: Status::Ok,
            session: SessionDto::new(regenerated.session, ctx.api_version.includes_tenant_id()),
            access_token: regenerated.access_token.map(TokenDto::from),
        })),
        Err(e) => Ok(RegenerateSessionResponse::Failed(status_message(e)?)),
    }
}
