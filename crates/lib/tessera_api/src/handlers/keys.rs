//! Public key discovery.

use tessera_core::keys::Jwks;

use crate::error::ApiResult;
use crate::{AppState, RequestContext};

/// `jwks.json`: every key a verifier may meet.
pub async fn jwks_handler(state: &AppState, ctx: &RequestContext) -> ApiResult<Jwks> {
    Ok(state.engine.jwks(&ctx.scope).await?)
}
