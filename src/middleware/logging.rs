use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Logs request start and completion. Completion lines carry the
/// `session_id` path parameter when the route has one.
pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        debug!(method = %method, uri = %uri, remote_addr = %remote_addr, "Request started");

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis();

            match &result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let session_id = response
                        .request()
                        .match_info()
                        .get("session_id")
                        .unwrap_or("-")
                        .to_string();
                    if response.status().is_server_error() {
                        error!(method = %method, uri = %uri, session_id = %session_id, status, duration_ms, "Request completed");
                    } else if response.status().is_client_error() {
                        warn!(method = %method, uri = %uri, session_id = %session_id, status, duration_ms, "Request completed");
                    } else {
                        info!(method = %method, uri = %uri, session_id = %session_id, status, duration_ms, "Request completed");
                    }
                }
                Err(err) => {
                    error!(
                        method = %method,
                        uri = %uri,
                        remote_addr = %remote_addr,
                        duration_ms,
                        error = %err,
                        "Request failed"
                    );
                }
            }

            result
        })
    }
}
