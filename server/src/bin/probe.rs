//! Command-line viewer for smoke-testing a running relay.
//!
//! Connects like a browser viewer would, optionally logs in and subscribes to a lobby,
//! then prints every call and decoded event block it receives.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use serde_json::json;
use shared::{Event, Lz4Codec, PacketCodec, ServerPacket, CLIENT_CLASS};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Relay WebSocket URL
    #[clap(short, long, default_value = "ws://127.0.0.1:8080")]
    url: String,
    /// Login token sent with `Client.setUser`
    #[clap(short, long)]
    token: Option<String>,
    /// Lobby to subscribe to
    #[clap(short, long)]
    lobby: Option<String>,
    /// Stop after this many seconds
    #[clap(short, long, default_value = "30")]
    seconds: u64,
    /// Print individual events from binary blocks, not just their count
    #[clap(short, long)]
    verbose: bool,
}

fn call(method: &str, args: Vec<serde_json::Value>) -> Result<Message, serde_json::Error> {
    let event = Event::new(CLIENT_CLASS, method, args);
    Ok(Message::Text(serde_json::to_string(&event)?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let (ws, _) = connect_async(args.url.as_str()).await?;
    let (mut sender, mut receiver) = ws.split();
    info!("Connected to {}", args.url);

    if let Some(token) = &args.token {
        sender.send(call("setUser", vec![json!(token)])?).await?;
    }
    if let Some(lobby) = &args.lobby {
        sender.send(call("subscribe", vec![json!(lobby)])?).await?;
    }

    let codec = Lz4Codec;
    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    let mut blocks = 0u64;
    let mut events = 0u64;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            message = receiver.next() => {
                let Some(message) = message else { break };
                match message? {
                    Message::Text(text) => {
                        if let Ok(ServerPacket::AssignId { id }) = serde_json::from_str(&text) {
                            println!("Assigned session id {}", id);
                            continue;
                        }
                        match serde_json::from_str::<Event>(&text) {
                            Ok(event) if event.is(CLIENT_CLASS, "ping") => {
                                sender.send(call("pong", event.args)?).await?;
                            }
                            Ok(event) => println!("{}.{} {:?}", event.origin_class, event.method, event.args),
                            Err(e) => warn!("Unrecognised text frame: {}", e),
                        }
                    }
                    Message::Binary(bytes) => match codec.decode(&bytes) {
                        Ok(batch) => {
                            blocks += 1;
                            events += batch.len() as u64;
                            println!("Block of {} events ({} bytes)", batch.len(), bytes.len());
                            if args.verbose {
                                for event in batch {
                                    println!("  {}.{} {:?}", event.origin_class, event.method, event.args);
                                }
                            }
                        }
                        Err(e) => warn!("Undecodable block: {}", e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    println!("Received {} blocks with {} events", blocks, events);
    Ok(())
}
