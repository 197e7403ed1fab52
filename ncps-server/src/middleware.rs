use anyhow::anyhow;
use axum::{
    extract::{Extension, Host},
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::error::{ServerError, ServerResult};
use crate::State;

/// Restricts valid `Host` headers to `allowed-hosts`, when configured.
///
/// An empty `allowed-hosts` list (the default) accepts any host, useful
/// for local development and deployments that put a reverse proxy in
/// front that already validates the host.
pub async fn restrict_host<B>(
    Extension(state): Extension<State>,
    Host(host): Host,
    req: Request<B>,
    next: Next<B>,
) -> ServerResult<Response> {
    let allowed_hosts = &state.config.allowed_hosts;

    if !allowed_hosts.is_empty() && !allowed_hosts.iter().any(|h| h.as_str() == host) {
        return Err(ServerError::RequestError(anyhow!("Bad Host")));
    }

    Ok(next.run(req).await)
}
