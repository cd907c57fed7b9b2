use std::error::Error;
use std::time::Duration;

use antalla_stream::stream::listeners::LifecycleCategory;
use antalla_stream::stream::proto::ExchangeMsg;
use antalla_stream::stream::transport::SocketEvent;
use antalla_stream::{process_config, StreamClient};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let config = process_config();
        let mut client = StreamClient::from_config(config)?;
        println!("environment={} endpoint={}", config.indicator(), client.endpoint());

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        for category in [
            LifecycleCategory::Open,
            LifecycleCategory::Error,
            LifecycleCategory::Close,
        ] {
            let events_tx = events_tx.clone();
            client.add_event_listener(category, move |event| {
                let _ = events_tx.send(event.clone());
            });
        }

        let (exchanges_tx, mut exchanges_rx) = mpsc::unbounded_channel();
        client.add_exchanges_listener(move |data, _| {
            let _ = exchanges_tx.send(data);
        });

        let mut errors = client.take_dispatch_errors().ok_or("dispatch errors taken")?;
        client.start();

        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => match event {
                    SocketEvent::Open => client.list_exchanges()?,
                    SocketEvent::Error(err) => eprintln!("socket error: {err}"),
                    SocketEvent::Close { code, reason } => {
                        println!("closed code={code} reason={reason}");
                        break;
                    }
                    SocketEvent::Message(_) => {}
                },
                Some(data) = exchanges_rx.recv() => {
                    let exchanges: Vec<ExchangeMsg> = serde_json::from_value(data)?;
                    for exchange in exchanges {
                        println!(
                            "exchange id={} name={} markets={}",
                            exchange.id,
                            exchange.name,
                            exchange.markets.len()
                        );
                    }
                    client.close();
                }
                Some(err) = errors.recv() => eprintln!("undecodable frame: {err}"),
                _ = tokio::time::sleep(Duration::from_secs(10)) => {
                    eprintln!("no reply within 10s");
                    client.close();
                }
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
