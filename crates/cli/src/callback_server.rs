use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use {
    anyhow::{Result, anyhow, bail},
    axum::{Router, extract::Query, response::Html, routing::get},
    tokio::{net::TcpListener, sync::oneshot},
    tracing::debug,
};

/// One-shot local HTTP server that receives the authorization callback.
pub struct CallbackServer {
    listener: TcpListener,
    path: String,
}

impl CallbackServer {
    /// Bind before the authorization link is handed out so the callback
    /// cannot arrive early.
    pub async fn bind(addr: SocketAddr, path: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        debug!(addr = %listener.local_addr()?, path, "callback server listening");
        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for one GET on the callback path and return its query parameters.
    pub async fn wait(self, timeout: Duration) -> Result<HashMap<String, String>> {
        let (tx, rx) = oneshot::channel::<Result<HashMap<String, String>>>();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));

        let app = Router::new().route(
            &self.path,
            get(move |Query(params): Query<HashMap<String, String>>| {
                let tx = tx.lock().unwrap_or_else(|e| e.into_inner()).take();
                async move {
                    let (reply, page) = match params.get("error") {
                        Some(error) => (
                            Err(anyhow!("authorization refused: {error}")),
                            Html(format!("<h1>Linking failed</h1><p>{error}</p>")),
                        ),
                        None => (
                            Ok(params),
                            Html(
                                "<h1>Account linked</h1><p>You can close this window.</p>"
                                    .to_string(),
                            ),
                        ),
                    };
                    if let Some(tx) = tx {
                        let _ = tx.send(reply);
                    }
                    page
                }
            }),
        );

        let server = axum::serve(self.listener, app);

        tokio::select! {
            result = rx => {
                result?
            }
            _ = server.into_future() => {
                bail!("callback server exited unexpectedly")
            }
            _ = tokio::time::sleep(timeout) => {
                bail!("no callback received within {} seconds", timeout.as_secs())
            }
        }
    }
}
