//! Stream subscription demo.
//!
//! Connects to a price feed stream endpoint, subscribes to one feed, prints
//! updates for thirty seconds, then shuts down. Replace the endpoint and feed
//! id placeholders before running.

use std::error::Error;
use std::time::Duration;

use pricefeed_sdk::stream::session::{PriceFeedSession, SessionOptions};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let endpoint = "wss://REPLACE_WITH_STREAM_ENDPOINT/ws";
    let feed_id = "REPLACE_WITH_FEED_ID";

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let session = PriceFeedSession::new(SessionOptions::new(endpoint).with_verbose(true));

        let _handle = session.subscribe([feed_id], |feed| {
            println!(
                "feed={} price={}e{} conf={} publish_time={}",
                feed.id, feed.price.price, feed.price.expo, feed.price.conf,
                feed.price.publish_time
            );
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        session.close();
    });

    Ok(())
}
