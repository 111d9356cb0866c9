use std::rc::Rc;

use suede::{Handler, Message, Server, Session, server::ServerStream};
use tracing::info;

struct Echo;

impl Handler<ServerStream> for Echo {
    async fn on_connect(&self, session: &Rc<Session<ServerStream>>) {
        info!(session = session.id(), "client connected");
    }

    async fn on_message(&self, session: &Rc<Session<ServerStream>>, message: Message) {
        info!(session = session.id(), %message, "message");
        if let Err(e) = session.send(message).await {
            eprintln!("Error writing message: {e}");
        }
    }

    async fn on_disconnect(&self, session: &Rc<Session<ServerStream>>) {
        info!(session = session.id(), "client disconnected");
    }
}

#[monoio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let server = Server::bind("127.0.0.1:8080")
        .expect("Failed to bind")
        .path("/chat");
    println!("Echo server listening on ws://127.0.0.1:8080/chat");

    if let Err(e) = server.run(Echo).await {
        eprintln!("Server stopped: {e}");
    }
}
