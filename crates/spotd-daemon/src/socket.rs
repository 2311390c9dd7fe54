use crate::BroadcastMessage;
use spotd_proto::protocol::{Broadcast, Command, Message, MAX_FRAME_LEN, PROTOCOL_VERSION};
use spotd_proto::state::{StateStore, KEY_CMD, LOGOUT_SENTINEL};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bind the UI socket and serve clients until `shutdown` fires.
pub async fn start_server(
    bind_address: &str,
    port: u16,
    store: Arc<StateStore>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    shutdown: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("UI socket listening at {}", listener.local_addr()?);

    Ok(tokio::spawn(async move {
        let mut client_id = 0usize;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let store = store.clone();
                    let bcast_tx = broadcast_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = handle_client(stream, store, id, bcast_tx, bcast_rx) => {}
                        }
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
        info!("UI socket closed");
    }))
}

async fn handle_client(
    stream: TcpStream,
    store: Arc<StateStore>,
    client_id: usize,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    if let Ok(encoded) = encode_hello(&store).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let Some(len) = Message::frame_len(&read_buf) else { break };
                            if len > MAX_FRAME_LEN {
                                warn!("Client {} sent a {} byte frame, disconnecting", client_id, len);
                                return;
                            }
                            if read_buf.len() < 4 + len { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    match cmd {
                                        Command::Logout => {
                                            // the coordinator picks this up on its next tick
                                            store.set(KEY_CMD, LOGOUT_SENTINEL).await;
                                            let _ = broadcast_tx.send(BroadcastMessage::PropertiesUpdated);
                                        }
                                        Command::GetProperties => {
                                            if let Ok(encoded) = encode_properties(&store).await {
                                                if write_half.write_all(&encoded).await.is_err() {
                                                    return;
                                                }
                                            }
                                        }
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => {
                                    // frame is complete, so the body itself is bad
                                    warn!("Client {} sent a malformed frame: {}", client_id, e);
                                    read_buf.drain(..4 + len);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Ok(BroadcastMessage::PropertiesUpdated) => {
                        if let Ok(encoded) = encode_properties(&store).await {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(BroadcastMessage::Refresh) => {
                        if let Ok(encoded) = Message::Broadcast(Broadcast::Refresh).encode() {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        let broadcast = Broadcast::Log { message };
                        if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        if let Ok(encoded) = encode_properties(&store).await {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

async fn encode_hello(store: &StateStore) -> anyhow::Result<Vec<u8>> {
    let (rev, properties) = store.snapshot().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        rev,
        properties,
    })
    .encode()
}

async fn encode_properties(store: &StateStore) -> anyhow::Result<Vec<u8>> {
    let (rev, properties) = store.snapshot().await;
    Message::Broadcast(Broadcast::Properties { rev, properties }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotd_proto::state::KEY_TOKEN;

    async fn read_message(stream: &mut TcpStream) -> Message {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut frame = len.to_vec();
        frame.resize(4 + u32::from_be_bytes(len) as usize, 0);
        stream.read_exact(&mut frame[4..]).await.unwrap();
        Message::decode(&frame).unwrap().0
    }

    async fn serve(store: Arc<StateStore>) -> (TcpStream, broadcast::Sender<BroadcastMessage>, CancellationToken) {
        let (tx, _) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        start_server("127.0.0.1", port, store, tx.clone(), shutdown.clone())
            .await
            .unwrap();
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        (stream, tx, shutdown)
    }

    #[tokio::test]
    async fn hello_then_logout_writes_sentinel() {
        let store = Arc::new(StateStore::new());
        store.set(KEY_TOKEN, "T1").await;
        let (mut stream, _tx, shutdown) = serve(store.clone()).await;

        match read_message(&mut stream).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                properties,
                ..
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(properties.get(KEY_TOKEN).map(String::as_str), Some("T1"));
            }
            other => panic!("expected hello, got {:?}", other),
        }

        let logout = Message::Command(Command::Logout).encode().unwrap();
        stream.write_all(&logout).await.unwrap();

        // the logout write is announced back as a property update
        match read_message(&mut stream).await {
            Message::Broadcast(Broadcast::Properties { properties, .. }) => {
                assert_eq!(
                    properties.get(KEY_CMD).map(String::as_str),
                    Some(LOGOUT_SENTINEL)
                );
            }
            other => panic!("expected properties, got {:?}", other),
        }
        assert_eq!(store.get(KEY_CMD).await.as_deref(), Some(LOGOUT_SENTINEL));
        shutdown.cancel();
    }

    fn raw_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    #[tokio::test]
    async fn malformed_frame_does_not_block_later_commands() {
        let store = Arc::new(StateStore::new());
        let (mut stream, _tx, shutdown) = serve(store.clone()).await;
        let _hello = read_message(&mut stream).await;

        let mut bytes = raw_frame(b"{bad}");
        bytes.extend(Message::Command(Command::Logout).encode().unwrap());
        stream.write_all(&bytes).await.unwrap();

        assert!(matches!(
            read_message(&mut stream).await,
            Message::Broadcast(Broadcast::Properties { .. })
        ));
        assert_eq!(store.get(KEY_CMD).await.as_deref(), Some(LOGOUT_SENTINEL));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn oversized_frame_drops_the_client() {
        let store = Arc::new(StateStore::new());
        let (mut stream, _tx, shutdown) = serve(store).await;
        let _hello = read_message(&mut stream).await;

        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        stream.write_all(&header).await.unwrap();

        let mut rest = Vec::new();
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            stream.read_to_end(&mut rest),
        )
        .await
        .unwrap();
        assert!(read.is_ok());
        assert!(rest.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn refresh_is_forwarded() {
        let store = Arc::new(StateStore::new());
        let (mut stream, tx, shutdown) = serve(store).await;
        let _hello = read_message(&mut stream).await;

        // client subscribes before the hello is written
        tx.send(BroadcastMessage::Refresh).unwrap();
        assert!(matches!(
            read_message(&mut stream).await,
            Message::Broadcast(Broadcast::Refresh)
        ));
        shutdown.cancel();
    }
}
