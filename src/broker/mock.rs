//! Scripted broker peer for unit tests.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::broker::resp::{decode, Value};

pub(crate) async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    (listener, addr)
}

/// Address that refuses connections.
pub(crate) async fn closed_addr() -> String {
    let (listener, addr) = listen().await;
    drop(listener);
    addr
}

pub(crate) fn role_reply(role: &str) -> Value {
    Value::Array(vec![Value::bulk(role), Value::Integer(0), Value::Array(Vec::new())])
}

pub(crate) struct MockPeer {
    socket: TcpStream,
    buf: Vec<u8>,
}

impl MockPeer {
    pub(crate) async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = listener.accept().await.expect("accept");
        Self {
            socket,
            buf: Vec::new(),
        }
    }

    /// Next command as text arguments, or `None` once the client hangs up.
    pub(crate) async fn next_command(&mut self) -> Option<Vec<String>> {
        loop {
            if let Some((value, used)) = decode(&self.buf).expect("client sent a valid frame") {
                self.buf.drain(..used);
                let Value::Array(items) = value else {
                    panic!("commands are arrays, got {value:?}");
                };
                return Some(
                    items
                        .iter()
                        .map(|item| item.as_str().unwrap_or_default().to_string())
                        .collect(),
                );
            }
            let mut chunk = [0u8; 512];
            match self.socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(read) => self.buf.extend_from_slice(&chunk[..read]),
            }
        }
    }

    pub(crate) async fn reply(&mut self, value: Value) {
        let _ = self.socket.write_all(&value.encode()).await;
    }
}
