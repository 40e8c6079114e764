use gyre_pubsub::Broker;
use tokio::join;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    let broker = Broker::<i32>::new(2, 2).unwrap();

    let (tx1, mut rx1) = mpsc::channel(4);
    let (tx2, mut rx2) = mpsc::channel(4);
    broker.subscribe(tx1).unwrap();
    broker.subscribe(tx2).unwrap();

    let handle1 = tokio::spawn(async move {
        while let Some(s) = rx1.recv().await {
            println!("1: {:?}", s);
        }
    });

    let handle2 = tokio::spawn(async move {
        while let Some(s) = rx2.recv().await {
            println!("2: {:?}", s);
        }
    });

    let broker_cloned = broker.clone();
    let handle3 = tokio::spawn(async move {
        for i in 1..32 {
            broker_cloned.publish(i).await.unwrap();
        }
    });

    let broker_cloned = broker.clone();
    let handle4 = tokio::spawn(async move {
        for i in 32..64 {
            broker_cloned.publish(i).await.unwrap();
        }
    });

    let (published1, published2) = join!(handle3, handle4);
    published1.unwrap();
    published2.unwrap();

    broker.close().await;
    let (printed1, printed2) = join!(handle1, handle2);
    printed1.unwrap();
    printed2.unwrap();
}
