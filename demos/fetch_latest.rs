//! Snapshot query demo.
//!
//! Fetches the latest price for a set of feed ids over the HTTP API. Replace
//! the endpoint and feed id placeholders before running.

use std::error::Error;

use pricefeed_sdk::feed_api::FeedApiClient;

fn main() -> Result<(), Box<dyn Error>> {
    let endpoint = "https://REPLACE_WITH_API_ENDPOINT";
    let feed_ids = ["REPLACE_WITH_FEED_ID_1", "REPLACE_WITH_FEED_ID_2"];

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = FeedApiClient::new(endpoint)?;

        let known = client.price_feed_ids().await?;
        println!("service exposes {} feeds", known.len());

        let feeds = client.latest_price_feeds(&feed_ids, false).await?;
        for feed in feeds {
            println!(
                "feed={} price={}e{} publish_time={}",
                feed.id, feed.price.price, feed.price.expo, feed.price.publish_time
            );
        }

        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
