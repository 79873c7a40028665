//! Scripted sync server for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use folio_sync::protocol::{create_step2, parse_message};
use folio_sync::varint::{encode_string, VarReader};
use folio_sync::{ConnectionState, SyncMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
pub enum AuthReply {
    Accept,
    Reject(Option<String>),
}

/// How the server answers.
#[derive(Debug, Clone)]
pub struct Script {
    pub auth: AuthReply,
    /// Reply to the client's step 1 with step 2
    pub answer_step1: bool,
    /// Step 2 payload
    pub step2: Vec<u8>,
    /// Frames sent right after step 2
    pub after_sync: Vec<Vec<u8>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            auth: AuthReply::Accept,
            answer_step1: true,
            step2: Vec::new(),
            after_sync: Vec::new(),
        }
    }
}

/// A frame as seen by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Auth(String),
    Message(SyncMessage),
}

pub struct MockServer {
    pub url: String,
    frames: mpsc::UnboundedReceiver<Received>,
    push: broadcast::Sender<Vec<u8>>,
    connections: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let paths = Arc::new(Mutex::new(Vec::new()));

        let accept_push = push.clone();
        let accept_connections = Arc::clone(&connections);
        let accept_paths = Arc::clone(&paths);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    stream,
                    script.clone(),
                    frame_tx.clone(),
                    accept_push.subscribe(),
                    Arc::clone(&accept_paths),
                ));
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{port}"),
            frames,
            push,
            connections,
            paths,
        }
    }

    /// Send a frame to every live connection.
    pub fn push(&self, frame: Vec<u8>) {
        let _ = self.push.send(frame);
    }

    /// Close every live connection with a close frame.
    pub fn close_connections(&self) {
        let _ = self.push.send(Vec::new());
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn request_paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    /// Next frame from any client.
    pub async fn next_frame(&mut self) -> Received {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("server stopped")
    }

    /// Wait for the next incremental update, skipping handshake frames.
    pub async fn next_update(&mut self) -> Vec<u8> {
        loop {
            if let Received::Message(SyncMessage::Update(payload)) = self.next_frame().await {
                return payload;
            }
        }
    }

    /// Frames received so far, without waiting.
    pub fn drain_frames(&mut self) -> Vec<Received> {
        let mut out = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            out.push(frame);
        }
        out
    }
}

async fn serve(
    stream: TcpStream,
    script: Script,
    frames: mpsc::UnboundedSender<Received>,
    mut push: broadcast::Receiver<Vec<u8>>,
    paths: Arc<Mutex<Vec<String>>>,
) {
    let record_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        paths.lock().unwrap().push(request.uri().path().to_string());
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, record_path).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();

    loop {
        let data = tokio::select! {
            pushed = push.recv() => match pushed {
                Ok(frame) if frame.is_empty() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                Ok(frame) => {
                    if sink.send(Message::Binary(frame.into())).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(_) => continue,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            },
        };

        let mut replies = Vec::new();
        if data.first() == Some(&2) {
            let mut reader = VarReader::new(&data[1..]);
            let token = reader.read_string().unwrap_or_default();
            let _ = frames.send(Received::Auth(token));
            match &script.auth {
                AuthReply::Accept => replies.push(vec![2, 1]),
                AuthReply::Reject(reason) => {
                    let mut frame = vec![2, 0];
                    if let Some(reason) = reason {
                        encode_string(reason, &mut frame);
                    }
                    replies.push(frame);
                }
            }
        } else {
            let message = parse_message(&data);
            let is_step1 = matches!(message, SyncMessage::Step1(_));
            let _ = frames.send(Received::Message(message));
            if is_step1 && script.answer_step1 {
                replies.push(create_step2(&script.step2));
                replies.extend(script.after_sync.iter().cloned());
            }
        }

        for reply in replies {
            if sink.send(Message::Binary(reply.into())).await.is_err() {
                return;
            }
        }
    }
}

/// A port nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("ws://127.0.0.1:{port}")
}

pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    timeout(WAIT, rx.wait_for(|state| *state == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target:?}"))
        .expect("state channel closed");
}

/// Poll `check` until it holds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
