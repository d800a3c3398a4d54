//! Test doubles: a recording in-memory transport and a scripted HTTP
//! server for tests that need a fixed sequence of responses (retry loops,
//! ETag handshakes). Each scripted response answers exactly one connection
//! and closes it.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::transport::{Response, Transport};

/// In-memory [`Transport`] that records every payload it is handed.
pub(crate) struct RecordingTransport {
    payloads: Mutex<Vec<String>>,
    delay: Duration,
    status: i32,
}

impl RecordingTransport {
    pub fn new() -> Self {
        RecordingTransport {
            payloads: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            status: 200,
        }
    }

    /// A transport that stalls for `delay` on every send, for exercising
    /// queue overflow while a request is in flight.
    pub fn stalled(delay: Duration) -> Self {
        RecordingTransport {
            delay,
            ..RecordingTransport::new()
        }
    }

    pub fn failing(status: i32) -> Self {
        RecordingTransport {
            status,
            ..RecordingTransport::new()
        }
    }

    /// Recorded payloads, parsed.
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.payloads
            .lock()
            .expect("payloads lock")
            .iter()
            .map(|p| serde_json::from_str(p).expect("recorded payload is JSON"))
            .collect()
    }

    /// The `batch` arrays of every recorded payload.
    pub fn batches(&self) -> Vec<Vec<serde_json::Value>> {
        self.payloads()
            .into_iter()
            .map(|p| p["batch"].as_array().expect("batch array").clone())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send_batch(&self, payload: &str) -> Response {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.payloads
            .lock()
            .expect("payloads lock")
            .push(payload.to_owned());
        Response {
            status: self.status,
            ..Response::default()
        }
    }
}

pub(crate) struct ScriptedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl ScriptedResponse {
    pub fn new(status: u16) -> Self {
        ScriptedResponse {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.body = body.to_owned();
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) struct ScriptedServer {
    pub url: String,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    pub fn start(responses: Vec<ScriptedResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let url = format!("http://{}", listener.local_addr().expect("listener addr"));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        let handle = std::thread::spawn(move || {
            for response in responses {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                serve_one(stream, &response, &recorded);
            }
        });
        ScriptedServer {
            url,
            requests,
            handle,
        }
    }

    /// Wait for the whole script to be consumed.
    pub fn join(self) -> Vec<RecordedRequest> {
        self.handle.join().expect("scripted server thread");
        self.requests
            .lock()
            .expect("requests lock")
            .clone()
    }
}

fn serve_one(
    mut stream: TcpStream,
    response: &ScriptedResponse,
    recorded: &Arc<Mutex<Vec<RecordedRequest>>>,
) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone test stream"));

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let path = parts.next().unwrap_or_default().to_owned();

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_owned();
            let value = value.trim().to_owned();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().unwrap_or(0);
            }
            headers.push((name, value));
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 && reader.read_exact(&mut body).is_err() {
        return;
    }

    recorded.lock().expect("requests lock").push(RecordedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let mut out = format!("HTTP/1.1 {} Scripted\r\n", response.status);
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.body.len(),
        response.body
    ));
    let _ = stream.write_all(out.as_bytes());
    let _ = stream.flush();
}
