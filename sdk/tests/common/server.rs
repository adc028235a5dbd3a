// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stagehand_provider::reqwest::Client;
use stagehand_provider::ReqwestExecutor;
use stagehand_sdk::{TransferConfig, TransferContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What the server does with one connection.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Announces `len` bytes, sends `sent`, then goes quiet until the client hangs up.
    Stall { len: usize, sent: Vec<u8> },
    /// Sends `body` one byte at a time, `gap` apart.
    Trickle { body: Vec<u8>, gap: Duration },
    /// Sends `body` at once.
    Full(Vec<u8>),
}

/// Plain HTTP/1.1 server for GET requests. Connection `n` gets reply `n`, and the last reply
/// repeats once the list runs out.
pub struct TestServer {
    addr: SocketAddr,
    connections: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(replies: Vec<Reply>) -> io::Result<Self> {
        assert!(!replies.is_empty());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU32::new(0));
        let counter = connections.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
                let reply = replies[n.min(replies.len() - 1)].clone();
                tokio::spawn(async move {
                    let _ = serve(socket, reply).await;
                });
            }
        });
        Ok(Self {
            addr,
            connections,
            task,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint(), path.trim_start_matches('/'))
    }

    /// Connections accepted so far, one per HTTP attempt.
    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A real HTTP context that ignores proxy settings from the environment.
pub fn local_context(config: TransferConfig) -> TransferContext {
    let client = Client::builder().no_proxy().build().unwrap();
    let mut context = TransferContext::new(config)
        .unwrap()
        .with_executor(Arc::new(ReqwestExecutor::new(client.clone())));
    context.http_client = client;
    context
}

fn head(len: usize) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        len
    )
}

async fn read_request(socket: &mut TcpStream) -> io::Result<()> {
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&chunk[..n]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(());
        }
    }
}

async fn serve(mut socket: TcpStream, reply: Reply) -> io::Result<()> {
    read_request(&mut socket).await?;
    match reply {
        Reply::Stall { len, sent } => {
            socket.write_all(head(len).as_bytes()).await?;
            socket.write_all(&sent).await?;
            socket.flush().await?;
            let mut rest = [0u8; 64];
            while socket.read(&mut rest).await? > 0 {}
        }
        Reply::Trickle { body, gap } => {
            socket.write_all(head(body.len()).as_bytes()).await?;
            socket.flush().await?;
            for byte in body {
                tokio::time::sleep(gap).await;
                socket.write_all(&[byte]).await?;
                socket.flush().await?;
            }
        }
        Reply::Full(body) => {
            socket.write_all(head(body.len()).as_bytes()).await?;
            socket.write_all(&body).await?;
            socket.flush().await?;
        }
    }
    Ok(())
}
