use std::time::Duration;

use suede::Client;

#[monoio::main(timer_enabled = true)]
async fn main() {
    tracing_subscriber::fmt::init();

    let connection = Client::new("ws://127.0.0.1:8080/ping")
        .expect("Invalid URL")
        .connect(())
        .await
        .expect("Can't connect");
    println!("Connected, pinging...");

    let session = connection.session().clone();
    monoio::spawn(async move {
        let mut interval = monoio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            println!("Pinging...");
            if session.ping("ping").await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = connection.join().await {
        eprintln!("Connection ended: {e}");
    }
}
