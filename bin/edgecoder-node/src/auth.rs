//! Mesh-token HTTP middleware.

use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::AUTHORIZATION;
use jsonrpsee::server::{HttpBody, HttpRequest, HttpResponse};
use tower::{Layer, Service};
use tracing::debug;

/// Requires `Authorization: Bearer <mesh token>` on every request when a
/// token is configured. Without a configured token the endpoint is open
/// (single-operator deployments).
#[derive(Debug, Clone)]
pub(crate) struct MeshAuthLayer {
    token: Option<Arc<String>>,
}

impl MeshAuthLayer {
    pub(crate) fn new(token: Option<String>) -> Self {
        Self {
            token: token.map(Arc::new),
        }
    }
}

impl<S> Layer<S> for MeshAuthLayer {
    type Service = MeshAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MeshAuth {
            inner,
            token: self.token.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MeshAuth<S> {
    inner: S,
    token: Option<Arc<String>>,
}

impl<S> Service<HttpRequest<HttpBody>> for MeshAuth<S>
where
    S: Service<HttpRequest<HttpBody>, Response = HttpResponse> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        std::pin::Pin<Box<dyn std::future::Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: HttpRequest<HttpBody>) -> Self::Future {
        let authorized = match &self.token {
            None => true,
            Some(token) => request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| {
                    value
                        .strip_prefix("Bearer ")
                        .is_some_and(|presented| presented == token.as_str())
                }),
        };

        if authorized {
            Box::pin(self.inner.call(request))
        } else {
            debug!("rejecting request without valid mesh token");
            Box::pin(async {
                Ok(HttpResponse::builder()
                    .status(http::StatusCode::UNAUTHORIZED)
                    .body(HttpBody::empty())
                    .expect("static response"))
            })
        }
    }
}
