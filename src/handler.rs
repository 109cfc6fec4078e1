use std::future::Future;

use async_trait::async_trait;

use crate::error::Unhandled;
use crate::http::{Request, Response};

/// Handles one request. Returning `Err(Unhandled)` lets dispatch fall
/// through to the next matching route; if no handler accepts, the server
/// answers `404`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Response, Unhandled>;
}

/// Adapts an async closure into a [Handler].
pub struct FnHandler<F>(F);

/// ```no_run
/// use stilt::{handler, Response};
///
/// let hello = handler(|_request| async { Ok(Response::text("hello")) });
/// # let _ = hello;
/// ```
pub fn handler<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Unhandled>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Unhandled>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<Response, Unhandled> {
        (self.0)(request).await
    }
}
