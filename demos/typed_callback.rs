use gyre_pubsub::Broker;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
enum Event {
    Connected(String),
    Message { from: String, body: String },
    Disconnected(String),
}

#[tokio::main]
async fn main() -> gyre_pubsub::Result<()> {
    let broker = Broker::<Event>::new(16, 2)?;

    broker.subscribe_func(|event| match event {
        Event::Connected(who) => println!("+ {who}"),
        Event::Message { from, body } => println!("{from}: {body}"),
        Event::Disconnected(who) => println!("- {who}"),
    })?;

    let messages = Arc::new(AtomicUsize::new(0));
    let counter = messages.clone();
    broker.subscribe_func(move |event| {
        if matches!(event, Event::Message { .. }) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    })?;

    broker.publish(Event::Connected("ada".into())).await?;
    broker
        .publish_batch([
            Event::Message {
                from: "ada".into(),
                body: "hello".into(),
            },
            Event::Message {
                from: "ada".into(),
                body: "anyone here?".into(),
            },
        ])
        .await?;
    broker.publish(Event::Disconnected("ada".into())).await?;

    broker.close().await;
    println!("{} messages seen", messages.load(Ordering::Relaxed));
    Ok(())
}
