//! Recording HTTP backend for end-to-end tests.
//!
//! Plays the role of the local service a tunnel client forwards to: records
//! every request it receives and answers with a configurable response, or
//! echoes the request body back.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// One request as the backend saw it.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
struct Reply {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    /// Respond with the request body instead of the configured one.
    echo: bool,
}

/// A local HTTP service backed by hyper, listening on an ephemeral port.
pub struct MockHttpService {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    reply: Arc<RwLock<Reply>>,
}

impl MockHttpService {
    pub async fn start() -> MockHttpService {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let requests: Arc<RwLock<Vec<RecordedRequest>>> = Arc::new(RwLock::new(Vec::new()));
        let reply = Arc::new(RwLock::new(Reply {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: b"OK".to_vec(),
            echo: false,
        }));

        let service_requests = requests.clone();
        let service_reply = reply.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let requests = service_requests.clone();
                let reply = service_reply.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let reply = reply.clone();
                        async move { handle(req, requests, reply).await }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        MockHttpService {
            addr,
            requests,
            reply,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    pub fn set_status(&self, status: StatusCode) {
        self.reply.write().status = status;
    }

    pub fn set_body(&self, body: impl Into<Vec<u8>>) {
        self.reply.write().body = body.into();
    }

    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.reply.write().headers.push((name.into(), value.into()));
    }

    /// Answer every request with its own body.
    pub fn set_echo(&self) {
        self.reply.write().echo = true;
    }
}

async fn handle(
    req: Request<Incoming>,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    reply: Arc<RwLock<Reply>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    requests.write().push(RecordedRequest {
        method,
        uri,
        headers,
        body: body.clone(),
    });

    let reply = reply.read().clone();
    let mut builder = Response::builder().status(reply.status);
    for (name, value) in &reply.headers {
        builder = builder.header(name, value);
    }
    let body = if reply.echo { body } else { reply.body };
    Ok(builder.body(Full::new(Bytes::from(body))).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_echoes() {
        let service = MockHttpService::start().await;
        service.set_echo();

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/echo", service.addr()))
            .body("ping")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ping");

        let requests = service.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].uri, "/echo");
        assert_eq!(requests[0].body, b"ping");
    }
}
