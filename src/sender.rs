//! One send attempt: dispatch on a cached handler, classify the outcome, read the body.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::body_reader::{BodyOutcome, ResponseBodyReader};
use crate::cancel::CancelToken;
use crate::classify::classify;
use crate::client::{HandlerFactory, OutgoingRequest};
use crate::error::{Error, Result};
use crate::handler_cache::{ConnectionHandlerCache, GlobalHandlerCache};
use crate::request::Request;
use crate::response::{Response, ResponseBody, ResponseCode};
use crate::settings::TransportSettings;
use crate::util::authority_of;

/// Performs a single send attempt.
///
/// Ordinary transport failures come back as a classified [`Response`]; the only error is
/// [`Error::StreamAlreadyUsed`].
pub trait RequestSender: Send + Sync {
    fn send<'a>(
        &'a self,
        request: &'a Request,
        connection_timeout: Option<Duration>,
        token: CancelToken,
    ) -> BoxFuture<'a, Result<Response>>;
}

/// Sends over HTTP/1.1 handlers from the two-tier handler cache.
pub struct HttpRequestSender {
    settings: Arc<TransportSettings>,
    handlers: ConnectionHandlerCache,
}

impl HttpRequestSender {
    pub fn new(
        settings: Arc<TransportSettings>,
        global: Arc<GlobalHandlerCache>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        let handlers = ConnectionHandlerCache::new(settings.clone(), global, factory);
        Self { settings, handlers }
    }

    async fn send_inner(
        &self,
        request: &Request,
        connection_timeout: Option<Duration>,
        token: CancelToken,
    ) -> Result<Response> {
        let target = authority_of(request.uri());
        let connection_timeout = connection_timeout.or(self.settings.connection_timeout);

        let outgoing = OutgoingRequest::from_request(request).map_err(|_| Error::StreamAlreadyUsed)?;
        let handler = self.handlers.obtain(connection_timeout);

        let incoming = match handler.dispatch(outgoing, token.clone()).await {
            Ok(incoming) => incoming,
            Err(err) => {
                return match classify(&err, token.is_canceled(), &target) {
                    Some(code) => Ok(Response::new(code)),
                    None => Err(Error::StreamAlreadyUsed),
                };
            }
        };

        trace!(authority = %target, status = %incoming.status, length = ?incoming.content_length, "Received response head");

        let reader = ResponseBodyReader::new(&self.settings);
        let outcome = reader
            .read(&target, incoming.content_length, incoming.body, &token)
            .await;

        let response = match outcome {
            BodyOutcome::Buffered(content) => {
                Response::http(incoming.status, incoming.headers, ResponseBody::Content(content))
            }
            BodyOutcome::Streamed(body) => Response::http(incoming.status, incoming.headers, ResponseBody::Stream(body)),
            BodyOutcome::TooLarge => Response::failure_with_headers(ResponseCode::InsufficientStorage, incoming.headers),
            BodyOutcome::ReceiveFailed => Response::failure_with_headers(ResponseCode::ReceiveFailure, incoming.headers),
            BodyOutcome::Canceled => Response::canceled(),
        };
        Ok(response)
    }
}

impl RequestSender for HttpRequestSender {
    fn send<'a>(
        &'a self,
        request: &'a Request,
        connection_timeout: Option<Duration>,
        token: CancelToken,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(self.send_inner(request, connection_timeout, token))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{ClientError, Handler, HandlerOptions, IncomingResponse, Kind};
    use crate::Body;
    use http::{HeaderMap, HeaderValue, StatusCode, Uri};
    use std::io;
    use std::sync::Mutex;

    type Script = Box<dyn Fn() -> std::result::Result<IncomingResponse, ClientError> + Send + Sync>;

    /// Answers every dispatch from a script, and records the options it was built with.
    struct ScriptedFactory {
        script: Arc<Script>,
        options: Mutex<Vec<HandlerOptions>>,
    }

    struct ScriptedHandler(Arc<Script>);

    impl Handler for ScriptedHandler {
        fn dispatch(
            &self,
            _request: OutgoingRequest,
            _token: CancelToken,
        ) -> BoxFuture<'_, std::result::Result<IncomingResponse, ClientError>> {
            let res = (self.0)();
            Box::pin(async move { res })
        }

        fn close(&self) {}
    }

    impl HandlerFactory for ScriptedFactory {
        fn create(&self, options: HandlerOptions) -> Arc<dyn Handler> {
            self.options.lock().unwrap().push(options);
            Arc::new(ScriptedHandler(self.script.clone()))
        }
    }

    fn sender_with(
        settings: TransportSettings,
        script: impl Fn() -> std::result::Result<IncomingResponse, ClientError> + Send + Sync + 'static,
    ) -> (HttpRequestSender, Arc<ScriptedFactory>) {
        let script: Script = Box::new(script);
        let factory = Arc::new(ScriptedFactory {
            script: Arc::new(script),
            options: Mutex::new(Vec::new()),
        });
        let sender = HttpRequestSender::new(
            Arc::new(settings),
            Arc::new(GlobalHandlerCache::with_capacity(4)),
            factory.clone(),
        );
        (sender, factory)
    }

    fn ok_response(body: &'static str, length: Option<u64>) -> IncomingResponse {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", HeaderValue::from_static("yes"));
        IncomingResponse {
            status: StatusCode::OK,
            headers,
            content_length: length,
            body: Body::from(body),
        }
    }

    fn request() -> Request {
        Request::get(Uri::from_static("http://example.org/"))
    }

    #[test]
    fn test_buffered_response() {
        let (sender, _) = sender_with(TransportSettings::default(), || Ok(ok_response("hello", Some(5))));
        let resp = smol::block_on(sender.send(&request(), None, CancelToken::new())).unwrap();
        assert_eq!(resp.code(), ResponseCode::Http(StatusCode::OK));
        assert_eq!(resp.content().unwrap().as_bytes(), b"hello");
    }

    #[test]
    fn test_too_large_keeps_headers() {
        let mut settings = TransportSettings::default();
        settings.max_response_body_size = Some(2);
        let (sender, _) = sender_with(settings, || Ok(ok_response("hello", Some(5))));

        let resp = smol::block_on(sender.send(&request(), None, CancelToken::new())).unwrap();
        assert_eq!(resp.code(), ResponseCode::InsufficientStorage);
        assert_eq!(resp.headers().get("x-test").unwrap(), "yes");
        assert!(matches!(resp.body(), ResponseBody::Empty));
    }

    #[test]
    fn test_failures_are_classified() {
        let (sender, _) = sender_with(TransportSettings::default(), || {
            Err(ClientError::request(io::Error::from(io::ErrorKind::ConnectionRefused)))
        });
        let resp = smol::block_on(sender.send(&request(), None, CancelToken::new())).unwrap();
        assert_eq!(resp.code(), ResponseCode::ConnectFailure);
        assert!(resp.headers().is_empty());
    }

    #[test]
    fn test_canceled_token_wins_classification() {
        let (sender, _) = sender_with(TransportSettings::default(), || {
            Err(ClientError::body_send(io::Error::from(io::ErrorKind::BrokenPipe)))
        });
        let token = CancelToken::new();
        token.cancel();
        let resp = smol::block_on(sender.send(&request(), None, token)).unwrap();
        assert_eq!(resp.code(), ResponseCode::Canceled);
    }

    #[test]
    fn test_reused_stream_is_an_error() {
        let (sender, _) = sender_with(TransportSettings::default(), || Ok(ok_response("", Some(0))));
        let request = Request::post(Uri::from_static("http://example.org/"))
            .with_stream(futures_util::io::Cursor::new(vec![1u8]), Some(1));

        assert!(smol::block_on(sender.send(&request, None, CancelToken::new())).is_ok());
        let err = smol::block_on(sender.send(&request, None, CancelToken::new())).unwrap_err();
        assert!(matches!(err, Error::StreamAlreadyUsed));
    }

    #[test]
    fn test_handler_stream_already_used_is_an_error() {
        let (sender, _) = sender_with(TransportSettings::default(), || Err(ClientError::stream_already_used()));
        let err = smol::block_on(sender.send(&request(), None, CancelToken::new())).unwrap_err();
        assert!(matches!(err, Error::StreamAlreadyUsed));
        assert_eq!(ClientError::stream_already_used().kind(), Kind::StreamAlreadyUsed);
    }

    #[test]
    fn test_connection_timeout_falls_back_to_settings() {
        let mut settings = TransportSettings::default();
        settings.connection_timeout = Some(Duration::from_millis(123));
        let (sender, factory) = sender_with(settings, || Ok(ok_response("", Some(0))));

        smol::block_on(sender.send(&request(), None, CancelToken::new())).unwrap();
        smol::block_on(sender.send(&request(), Some(Duration::from_secs(2)), CancelToken::new())).unwrap();

        let options = factory.options.lock().unwrap();
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].connect_timeout, Some(Duration::from_millis(123)));
        assert_eq!(options[1].connect_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_streamed_response() {
        let mut settings = TransportSettings::default();
        settings.use_response_streaming = Arc::new(|_| true);
        let (sender, _) = sender_with(settings, || Ok(ok_response("hello", None)));

        let resp = smol::block_on(sender.send(&request(), None, CancelToken::new())).unwrap();
        assert!(resp.has_stream());
        assert!(resp.content().is_none());
        let body = resp.into_stream().unwrap();
        assert_eq!(smol::block_on(body.into_string()).unwrap(), "hello");
    }
}
