use std::rc::Rc;

use suede::{Client, Handler, Message, Session, client::ClientStream};

struct Print;

impl Handler<ClientStream> for Print {
    async fn on_connect(&self, _session: &Rc<Session<ClientStream>>) {
        println!("Connect callback");
    }

    async fn on_message(&self, _session: &Rc<Session<ClientStream>>, message: Message) {
        println!("Data: {message}");
    }

    async fn on_disconnect(&self, _session: &Rc<Session<ClientStream>>) {
        println!("Disconnect callback");
    }
}

#[monoio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let connection = Client::new("ws://127.0.0.1:8080/chat")
        .expect("Invalid URL")
        .connect(Print)
        .await
        .expect("Can't connect");
    println!("Connected, the server responded with {}", connection.response().status());

    connection
        .session()
        .send("Hello from the WebSocket client!")
        .await
        .expect("Error sending message");

    if let Err(e) = connection.join().await {
        eprintln!("Connection ended: {e}");
    }
}
