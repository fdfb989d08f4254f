use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
};

/// Provider event stream stand-in.
pub struct WsTestServer {
    pub url: String,
    uris: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl WsTestServer {
    /// Request URIs (path and query) of the accepted upgrades, in order.
    pub fn requested_uris(&self) -> Vec<String> {
        self.uris.lock().unwrap().clone()
    }

    pub async fn finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }
}

/// Accepts `connections` clients one after another, handing each socket and its
/// index to `handler`. The next client is accepted once the handler returns.
pub async fn start_server<H, F>(connections: usize, handler: H) -> anyhow::Result<WsTestServer>
where
    H: Fn(usize, WebSocketStream<TcpStream>) -> F + Send + 'static,
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let uris = Arc::new(Mutex::new(Vec::new()));
    let recorded = uris.clone();

    let task = tokio::spawn(async move {
        for index in 0..connections {
            let (stream, _) = listener.accept().await?;
            let recorded = recorded.clone();
            let websocket = accept_hdr_async(
                stream,
                move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    recorded.lock().unwrap().push(request.uri().to_string());
                    Ok(response)
                },
            )
            .await?;
            handler(index, websocket).await?;
        }
        Ok(())
    });

    Ok(WsTestServer {
        url: format!("ws://{addr}"),
        uris,
        task,
    })
}

pub async fn start_single_client_server<H, F>(handler: H) -> anyhow::Result<WsTestServer>
where
    H: FnOnce(WebSocketStream<TcpStream>) -> F + Send + 'static,
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handler = Mutex::new(Some(handler));
    start_server(1, move |_, websocket| {
        let handler = handler.lock().unwrap().take();
        async move {
            match handler {
                Some(handler) => handler(websocket).await,
                None => anyhow::bail!("single client server accepted twice"),
            }
        }
    })
    .await
}
