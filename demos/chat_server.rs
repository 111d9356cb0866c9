use std::rc::Rc;

use suede::{Handler, Message, Registry, Server, Session, server::ServerStream};

struct Chat {
    room: Registry<ServerStream>,
}

impl Handler<ServerStream> for Chat {
    async fn on_connect(&self, _session: &Rc<Session<ServerStream>>) {
        self.room.broadcast("New user joined the chat!").await;
    }

    async fn on_message(&self, _session: &Rc<Session<ServerStream>>, message: Message) {
        let delivered = self.room.broadcast(message).await;
        tracing::debug!(delivered, "message relayed");
    }

    async fn on_disconnect(&self, _session: &Rc<Session<ServerStream>>) {
        self.room.broadcast("User has left the chat").await;
    }
}

#[monoio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let server = Server::bind("127.0.0.1:8080")
        .expect("Failed to bind")
        .path("/chat");
    let room = server.registry();
    println!("Chat server listening on ws://127.0.0.1:8080/chat");

    server.run(Chat { room }).await.expect("Server stopped");
}
