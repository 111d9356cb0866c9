use std::time::Duration;

use suede::Server;

#[monoio::main(timer_enabled = true)]
async fn main() {
    tracing_subscriber::fmt::init();

    let server = Server::bind("127.0.0.1:8080")
        .expect("Failed to bind")
        .path("/ping");
    let registry = server.registry();
    println!("WebSocket server started on ws://127.0.0.1:8080/ping");

    monoio::spawn(async move {
        let mut interval = monoio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let sessions = registry.sessions().await;
            println!("Pinging {} client(s)...", sessions.len());
            for session in sessions {
                if let Err(e) = session.ping("ping").await {
                    eprintln!("Ping to session {} failed: {e}", session.id());
                }
            }
        }
    });

    server.run(()).await.expect("Server stopped");
}
