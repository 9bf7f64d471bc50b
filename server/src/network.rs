//! Server network layer handling WebSocket connections and tick coordination

use crate::client_manager::{Outbound, Outbox};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::router::{RelayHandle, Router, RouterMessage};
use crate::services::Services;
use crate::utils::tick_period;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Main server coordinating sockets, the router and its timers
pub struct Server {
    listener: TcpListener,
    router: Router,
    router_rx: mpsc::UnboundedReceiver<RouterMessage>,
    tick_duration: Duration,
    heartbeat: Duration,
}

impl Server {
    pub async fn bind(config: RelayConfig, services: Services) -> Result<Self> {
        let tick_duration = tick_period(config.tick_rate)
            .ok_or_else(|| RelayError::InvalidConfig("tick rate must be at least 1".to_string()))?;
        let heartbeat = config.heartbeat;
        if heartbeat.is_zero() {
            return Err(RelayError::InvalidConfig(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }

        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        let (router, router_rx) = Router::channel(config, services);

        Ok(Server {
            listener,
            router,
            router_rx,
            tick_duration,
            heartbeat,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> RelayHandle {
        self.router.handle()
    }

    /// Spawns task that accepts sockets and hands each one its own connection task
    fn spawn_acceptor(listener: TcpListener, handle: RelayHandle) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, handle).await {
                                warn!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Main server loop. Returns once the router receives a shutdown message.
    pub async fn run(self) -> Result<()> {
        let Server {
            listener,
            mut router,
            mut router_rx,
            tick_duration,
            heartbeat,
        } = self;

        let acceptor = Self::spawn_acceptor(listener, router.handle());

        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat_interval = interval(heartbeat);
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Relay started at {:.0}Hz", 1.0 / tick_duration.as_secs_f64());

        loop {
            tokio::select! {
                // Handle socket and handle messages
                message = router_rx.recv() => {
                    match message {
                        Some(message) => {
                            if !router.handle_message(message, Instant::now()) {
                                break;
                            }
                        }
                        None => break,
                    }
                },

                // Handle network tick events
                _ = tick_interval.tick() => {
                    let started = Instant::now();
                    router.network_tick(started);

                    let elapsed = started.elapsed();
                    if elapsed > tick_duration {
                        warn!(
                            "Network tick took {:.1}ms, budget is {:.1}ms",
                            elapsed.as_secs_f64() * 1000.0,
                            tick_duration.as_secs_f64() * 1000.0
                        );
                    }
                },

                _ = heartbeat_interval.tick() => router.heartbeat(),
            }
        }

        acceptor.abort();
        Ok(())
    }
}

/// Runs one WebSocket session: a writer task drains the session's outbox while
/// this task forwards every inbound text frame to the router.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, handle: RelayHandle) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let client_id = Uuid::new_v4();
    let (outbox, mut outbound_rx) = Outbox::channel();
    handle.connect(client_id, Some(addr), outbox)?;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Binary(bytes) => Message::Binary(bytes),
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = ws_sender.send(message).await {
                debug!("Write to {} failed: {}", client_id, e);
                break;
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => handle.frame(client_id, text)?,
            Ok(Message::Binary(data)) => {
                debug!("Ignoring {} byte binary frame from {}", data.len(), client_id)
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from {} failed: {}", client_id, e);
                break;
            }
        }
    }

    handle.disconnect(client_id)?;
    if writer.await.is_err() {
        debug!("Writer task for {} did not finish cleanly", client_id);
    }
    Ok(())
}
