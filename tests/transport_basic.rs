
use courier::{CancelToken, Request, ResponseCode, Transport, TransportSettings};
use http::{StatusCode, Uri};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mock::{Behavior, FakeSender};

fn request() -> Request {
    Request::get(Uri::from_static("http://example.org/"))
}

fn settings(grace: Duration) -> TransportSettings {
    let mut settings = TransportSettings::default();
    settings.request_abort_timeout = grace;
    settings
}

#[test]
fn test_canceled_before_send() {
    let sender = FakeSender::new(Behavior::Respond(ResponseCode::Http(StatusCode::OK)));
    let transport = Transport::with_sender(TransportSettings::default(), sender.clone());

    let token = CancelToken::new();
    token.cancel();
    let resp = smol::block_on(transport.send(&request(), None, Duration::from_secs(1), &token)).unwrap();

    assert_eq!(resp.code(), ResponseCode::Canceled);
    assert_eq!(sender.calls(), 0);
}

#[test]
fn test_sub_millisecond_timeout() {
    let sender = FakeSender::new(Behavior::Respond(ResponseCode::Http(StatusCode::OK)));
    let transport = Transport::with_sender(TransportSettings::default(), sender.clone());

    for timeout in [Duration::ZERO, Duration::from_micros(999)].iter() {
        let resp = smol::block_on(transport.send(&request(), None, *timeout, &CancelToken::new())).unwrap();
        assert_eq!(resp.code(), ResponseCode::RequestTimeout);
    }
    assert_eq!(sender.calls(), 0);
}

#[test]
fn test_completes_within_deadline() {
    let sender = FakeSender::new(Behavior::Respond(ResponseCode::Http(StatusCode::NO_CONTENT)));
    let transport = Transport::with_sender(TransportSettings::default(), sender.clone());

    let resp = smol::block_on(transport.send(&request(), None, Duration::from_secs(1), &CancelToken::new())).unwrap();
    assert_eq!(resp.code(), ResponseCode::Http(StatusCode::NO_CONTENT));
    assert_eq!(sender.calls(), 1);
}

#[test]
fn test_timeout_cancels_attempt() {
    let sender = FakeSender::new(Behavior::WaitForCancel);
    let grace = Duration::from_millis(250);
    let transport = Transport::with_sender(settings(grace), sender.clone());

    let timeout = Duration::from_millis(50);
    let start = Instant::now();
    let resp = smol::block_on(transport.send(&request(), None, timeout, &CancelToken::new())).unwrap();

    assert_eq!(resp.code(), ResponseCode::RequestTimeout);
    assert_eq!(sender.cancellations(), 1);
    assert!(start.elapsed() >= timeout);
    assert!(start.elapsed() < timeout + grace + Duration::from_millis(500));
}

#[test]
fn test_abort_that_never_unwinds_is_bounded() {
    let sender = FakeSender::new(Behavior::Stubborn(Duration::from_secs(10)));
    let grace = Duration::from_millis(100);
    let transport = Transport::with_sender(settings(grace), sender.clone());

    let timeout = Duration::from_millis(50);
    let start = Instant::now();
    let resp = smol::block_on(transport.send(&request(), None, timeout, &CancelToken::new())).unwrap();

    assert_eq!(resp.code(), ResponseCode::RequestTimeout);
    assert!(start.elapsed() >= timeout + grace);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_caller_cancel_during_send() {
    let sender = FakeSender::new(Behavior::WaitForCancel);
    let transport = Transport::with_sender(TransportSettings::default(), sender.clone());
    let token = CancelToken::new();
    let canceler = token.clone();

    let resp = smol::block_on(async {
        smol::spawn(async move {
            futures_timer::Delay::new(Duration::from_millis(20)).await;
            canceler.cancel();
        })
        .detach();
        transport.send(&request(), None, Duration::from_secs(5), &token).await
    })
    .unwrap();

    assert_eq!(resp.code(), ResponseCode::Canceled);
    assert_eq!(sender.cancellations(), 1);
}

#[test]
fn test_transports_share_sender() {
    let sender = FakeSender::new(Behavior::Respond(ResponseCode::Http(StatusCode::OK)));
    let transport = Arc::new(Transport::with_sender(TransportSettings::default(), sender.clone()));

    let results = easy_parallel::Parallel::new()
        .each(0..8, |_| {
            smol::block_on(transport.send(&request(), None, Duration::from_secs(1), &CancelToken::new()))
                .unwrap()
                .code()
        })
        .run();

    assert!(results.iter().all(|code| *code == ResponseCode::Http(StatusCode::OK)));
    assert_eq!(sender.calls(), 8);
}
