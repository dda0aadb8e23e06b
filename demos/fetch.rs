//! Fetch every URL given on the command line concurrently, and print how each send concluded.
//!
//! cargo run --example fetch -- http://example.org/ http://127.0.0.1:9/

use courier::{CancelToken, Request, Transport, TransportSettings};
use futures::future::join_all;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut requests = Vec::new();
    for arg in std::env::args().skip(1) {
        requests.push(Request::get(arg.parse()?));
    }

    let mut settings = TransportSettings::default();
    settings.connection_timeout = Some(Duration::from_secs(2));
    let transport = Transport::new(settings);
    let token = CancelToken::new();

    let sends = requests
        .iter()
        .map(|req| transport.send(req, None, Duration::from_secs(10), &token));

    let responses = smol::block_on(join_all(sends));
    for (req, resp) in requests.iter().zip(responses) {
        let resp = resp?;
        let len = resp.content().map(|c| c.len()).unwrap_or(0);
        println!("{} -> {} ({} bytes)", req.uri(), resp.code(), len);
    }

    Ok(())
}
