use gyre_pubsub::Broker;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct Tick {
    seq: u64,
    price: f64,
}

#[tokio::main]
async fn main() -> gyre_pubsub::Result<()> {
    let broker = Broker::<Tick>::new(64, 4)?;

    let (input, feed) = mpsc::channel(16);
    let forwarding = broker.publish_from_queue(feed)?;

    let (tx, mut rx) = mpsc::channel(8);
    let subscription = broker.subscribe(tx)?;
    println!("subscribed as {}", subscription.id());

    let printer = tokio::spawn(async move {
        while let Some(tick) = rx.recv().await {
            println!("tick {} @ {:.2}", tick.seq, tick.price);
        }
    });

    for seq in 0..10 {
        let price = 100.0 + seq as f64 * 0.25;
        if input.send(Tick { seq, price }).await.is_err() {
            break;
        }
    }
    drop(input);
    forwarding.wait().await;

    subscription.unsubscribe().await?;
    subscription.finished().await;
    let _ = printer.await;

    broker.close().await;
    Ok(())
}
