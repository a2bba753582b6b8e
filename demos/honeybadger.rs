//! Honey badger which happily consumes bees and politely thanks the sender for each of them
//!
//! Runs against the Redis nodes given on the command line. With `--local` it instead runs
//! in-process together with a beekeeper which announces bees, sends one every second and
//! prints whatever comes back.

use anyhow::{anyhow, Context, Result};
use colony::library::communication::broker::SharedBroker;
use colony::library::communication::implementation::memory::MemoryBroker;
use colony::library::communication::implementation::redis::RedisLookup;
use colony::library::communication::{broker::BrokerNode, ServiceIdentity};
use colony::options::{BrokerOptions, LogOptions, ServiceOptions};
use colony::Service;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "honeybadger")]
struct Options {
    #[structopt(flatten)]
    service: ServiceOptions,

    #[structopt(flatten)]
    broker: BrokerOptions,

    #[structopt(flatten)]
    log: LogOptions,

    /// Run in-process with a beekeeper instead of connecting to Redis
    #[structopt(long)]
    local: bool,
}

async fn honeybadger(badger: Service) -> Result<()> {
    let responder = badger.clone();

    badger
        .consume("bees", move |mut bees| async move {
            while let Some(bee) = bees.recv().await {
                info!("got bee {} !", String::from_utf8_lossy(&bee.payload));

                let thanks = responder.new_response(&bee, "HoneyBadgerEtiquette", "thanks for the bee!");
                responder.emit(&thanks).await?;
                info!("sent response");

                if rand::random::<f64>() < 0.5 {
                    let request = responder.new_response(&bee, "SnakeRequest", "got any snakes?");
                    responder.emit(&request).await?;
                }
            }

            Ok(())
        })
        .await?;

    Ok(())
}

async fn beekeeper(keeper: Service) -> Result<()> {
    keeper.announce("bees").await?;

    for number in 1.. {
        let bee = keeper.new_message("bees", format!("bee #{}", number))?;

        keeper
            .request(&bee, |mut responses| async move {
                while let Some(response) = responses.recv().await {
                    info!(
                        "{} answered with {}: {}",
                        response.from_name,
                        response.content_type,
                        String::from_utf8_lossy(&response.payload)
                    );
                }

                Ok(())
            })
            .await?;

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::from_args();

    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&options.log.filter)
        .init();

    let identity = options.service.identity().context("invalid service identity")?;

    let badger = if options.local {
        let broker: SharedBroker = Arc::new(MemoryBroker::default());
        let node = BrokerNode::new("memory://honeybadger");

        let keeper = ServiceIdentity::new("beekeeper", "1")?;
        let keeper = Service::start(keeper, node.clone(), broker.clone()).await?;
        tokio::spawn(async move {
            if let Err(e) = beekeeper(keeper).await {
                warn!("Beekeeper gave up: {:?}", e);
            }
        });

        Service::start(identity, node, broker).await?
    } else {
        let lookup: RedisLookup = options.broker.lookup();
        Service::connect(identity, &lookup).await?
    };

    tokio::select! {
        result = honeybadger(badger.clone()) => result,
        fault = badger.terminated() => match fault {
            Some(fault) => Err(anyhow!(fault)),
            None => Ok(()),
        },
    }
}
