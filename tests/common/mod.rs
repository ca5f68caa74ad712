//! Local HTTP fixture server for end-to-end source tests.

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Canned response for one request.
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub location: Option<String>,
    pub delay: Duration,
}

impl Reply {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into().into_bytes(),
            content_type: "text/html; charset=utf-8",
            location: None,
            delay: Duration::ZERO,
        }
    }

    /// Raw bytes served as `text/html` with no charset parameter.
    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            content_type: "text/html",
            location: None,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: format!("status {status}").into_bytes(),
            content_type: "text/plain",
            location: None,
            delay: Duration::ZERO,
        }
    }

    /// 302 to `location`.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::status(302)
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Serves `handler(path_and_query)` on 127.0.0.1 from a background thread until dropped.
pub struct TestServer {
    pub base_url: String,
    hits: Arc<Mutex<Vec<String>>>,
    shutdown: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + 'static,
    {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base_url = format!("http://{}", server.server_addr());
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let log = Arc::clone(&hits);
        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            let request = match server.recv_timeout(Duration::from_millis(20)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };
            let path = request.url().to_string();
            log.lock().expect("hits lock").push(path.clone());

            let reply = handler(&path);
            if !reply.delay.is_zero() {
                thread::sleep(reply.delay);
            }
            let header = tiny_http::Header::from_bytes(
                &b"Content-Type"[..],
                reply.content_type.as_bytes(),
            )
            .expect("content-type header");
            let mut response = tiny_http::Response::from_data(reply.body)
                .with_status_code(reply.status)
                .with_header(header);
            if let Some(location) = &reply.location {
                let header = tiny_http::Header::from_bytes(&b"Location"[..], location.as_bytes())
                    .expect("location header");
                response = response.with_header(header);
            }
            let _ = request.respond(response);
        });

        Self {
            base_url,
            hits,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Every request path (with query) in arrival order.
    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().expect("hits lock").clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.hits().iter().filter(|p| p.as_str() == path).count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Build a source from TOML text, substituting `BASE` with the server's base URL.
pub fn source(server: &TestServer, toml_text: &str) -> sonovel::Source {
    let text = toml_text.replace("BASE", &server.base_url);
    let config = sonovel::config::parse_site_config(&text).expect("parse test source");
    sonovel::Source::new(config).expect("build test source")
}
