//! The per-call lifecycle: entry guards, the deadline race, and abort handling.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::client::Http1HandlerFactory;
use crate::error::Result;
use crate::handler_cache::GlobalHandlerCache;
use crate::request::Request;
use crate::response::Response;
use crate::sender::{HttpRequestSender, RequestSender};
use crate::settings::TransportSettings;
use crate::timeout::{race_with_grace, Deadline};
use crate::util::authority_of;

/// Budgets below this cannot complete a round trip, and are treated as already expired.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Sends requests with a hard per-call deadline.
///
/// Cheap to share: clone the `Arc` it lives in, or build several over the same settings. All
/// transports built with [`Transport::new`] share the process-wide handler cache.
#[derive(Clone)]
pub struct Transport {
    settings: Arc<TransportSettings>,
    sender: Arc<dyn RequestSender>,
}

impl Transport {
    pub fn new(settings: TransportSettings) -> Self {
        let settings = Arc::new(settings);
        let sender = HttpRequestSender::new(
            settings.clone(),
            GlobalHandlerCache::shared(),
            Arc::new(Http1HandlerFactory),
        );
        Self {
            settings,
            sender: Arc::new(sender),
        }
    }

    /// A transport that performs send attempts through `sender`.
    pub fn with_sender(settings: TransportSettings, sender: Arc<dyn RequestSender>) -> Self {
        Self {
            settings: Arc::new(settings),
            sender,
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Send `request`, concluding within `timeout` (plus the abort grace period at worst).
    ///
    /// `connection_timeout` bounds connection establishment; `None` uses the configured
    /// default. Every ordinary failure is reported through the response code; the only error
    /// is a second send of a one-shot body stream.
    pub async fn send(
        &self,
        request: &Request,
        connection_timeout: Option<Duration>,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<Response> {
        if token.is_canceled() {
            debug!(authority = %authority_of(request.uri()), "Request canceled before sending");
            return Ok(Response::canceled());
        }
        if timeout < MIN_TIMEOUT {
            warn!(
                authority = %authority_of(request.uri()),
                timeout = ?timeout,
                "Request timeout is too small to send within"
            );
            return Ok(Response::timeout());
        }

        let attempt_token = token.child();
        let attempt = self.sender.send(request, connection_timeout, attempt_token.clone());
        let grace = self.settings.request_abort_timeout;

        let outcome = race_with_grace(timeout, grace, attempt, || {
            attempt_token.cancel();
            warn!(
                authority = %authority_of(request.uri()),
                timeout = ?timeout,
                "Request timed out"
            );
        })
        .await;

        match outcome {
            Deadline::Completed(res) => res,
            Deadline::Expired { unwound } => {
                if !unwound {
                    warn!(
                        authority = %authority_of(request.uri()),
                        grace = ?grace,
                        "Timed out request did not finish aborting within the grace period"
                    );
                }
                Ok(Response::timeout())
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
