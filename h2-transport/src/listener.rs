use bytes::Bytes;
use http::Response;

use crate::error::Failure;
use crate::exchange::{ContentResponse, Exchange};

/// Per-exchange event hooks of the generic client.
///
/// Hooks run on the configured executor, one exchange's hooks strictly in
/// order, and may call [`Exchange::abort_request`] /
/// [`Exchange::abort_response`]. Every hook defaults to a no-op.
#[allow(unused_variables)]
pub trait ExchangeListener: Send + Sync {
    /// The exchange has been bound to a stream.
    fn on_request_begin(&self, exchange: &Exchange) {}

    /// Request headers have been handed to the session.
    fn on_request_headers(&self, exchange: &Exchange) {}

    /// The request is committed; its content is sent next.
    fn on_request_commit(&self, exchange: &Exchange) {}

    fn on_request_content(&self, exchange: &Exchange, content: &Bytes) {}

    fn on_request_success(&self, exchange: &Exchange) {}

    fn on_request_failure(&self, exchange: &Exchange, failure: &Failure) {}

    fn on_response_headers(&self, exchange: &Exchange, head: &Response<()>) {}

    fn on_response_content(&self, exchange: &Exchange, content: &Bytes) {}

    fn on_response_success(&self, exchange: &Exchange) {}

    fn on_response_failure(&self, exchange: &Exchange, failure: &Failure) {}

    /// Always the last hook, called exactly once.
    fn on_complete(&self, exchange: &Exchange, result: &Result<ContentResponse, Failure>) {}
}

/// No-op listener.
impl ExchangeListener for () {}
