//! Transport-level 401 interception
//!
//! Some credential failures happen deep inside a request pipeline, below
//! any code that could observe them directly. [`AuthInterceptLayer`]
//! decorates the outbound HTTP service for one cluster so that a 401
//! response reports a credential failure to that cluster's
//! [`AuthMonitor`]. The in-flight call itself is not failed differently
//! than any other request would be; the report is a side channel.
//!
//! The layer slots into kube's custom client stack between the auth layer
//! and the connector, so it sees the raw response status.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use tower::{Layer, Service};

use super::AuthMonitor;
use crate::Error;

/// `tower::Layer` producing an [`AuthIntercept`] bound to one cluster's
/// monitor
#[derive(Clone)]
pub struct AuthInterceptLayer {
    monitor: Arc<AuthMonitor>,
}

impl AuthInterceptLayer {
    /// Create a layer reporting to the given monitor
    pub fn new(monitor: Arc<AuthMonitor>) -> Self {
        Self { monitor }
    }
}

impl<S> Layer<S> for AuthInterceptLayer {
    type Service = AuthIntercept<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthIntercept {
            inner,
            monitor: self.monitor.clone(),
        }
    }
}

/// Service decorator that posts 401 responses to the auth monitor
#[derive(Clone)]
pub struct AuthIntercept<S> {
    inner: S,
    monitor: Arc<AuthMonitor>,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for AuthIntercept<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqB>) -> Self::Future {
        let monitor = self.monitor.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            let response = fut.await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                monitor.report_failure(&Error::credential(
                    "api server returned 401 Unauthorized",
                ));
            }
            Ok(response)
        })
    }
}
