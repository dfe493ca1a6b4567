//! Tests for webhook delivery against a local one-shot HTTP responder.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use runwatch::dispatcher::{dispatch, Alert, DispatchError, Notifier, WebhookNotifier};

/// Accept one connection, capture the raw request and answer with `status_line`.
async fn serve_once(status_line: &str) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = oneshot::channel();

    let status_line = status_line.to_owned();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = tx.send(request);
        }
    });

    (format!("http://{addr}/hook"), rx)
}

/// Read headers plus a `Content-Length` body.
async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0_u8; 1024];
    loop {
        let n = socket.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw).to_string();
        if let Some(header_end) = text.find("\r\n\r\n") {
            let length = text
                .lines()
                .find_map(|l| {
                    let lower = l.to_ascii_lowercase();
                    lower
                        .strip_prefix("content-length:")
                        .and_then(|v| v.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            if raw.len() >= header_end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&raw).to_string()
}

fn alert(suppressed: u64) -> Alert {
    Alert {
        prefix: "bali-node".to_owned(),
        line: "ERROR disk full".to_owned(),
        suppressed,
    }
}

#[tokio::test]
async fn posts_json_text_payload() {
    let (url, request) = serve_once("200 OK").await;
    let notifier = WebhookNotifier::new(url, Duration::from_secs(5));

    notifier.notify(&alert(2)).await.expect("delivered");

    let request = request.await.expect("request captured");
    assert!(request.starts_with("POST /hook HTTP/1.1"));
    assert!(request
        .to_ascii_lowercase()
        .contains("content-type: application/json"));

    let body = request.split("\r\n\r\n").nth(1).expect("body");
    let json: serde_json::Value = serde_json::from_str(body).expect("json body");
    assert_eq!(
        json,
        serde_json::json!({ "text": "bali-node\nERROR disk full\nSuppressed 2 duplicate(s)" })
    );
}

#[tokio::test]
async fn any_2xx_is_success() {
    let (url, _request) = serve_once("204 No Content").await;
    let notifier = WebhookNotifier::new(url, Duration::from_secs(5));
    assert!(notifier.notify(&alert(0)).await.is_ok());
}

#[tokio::test]
async fn non_2xx_is_status_error() {
    let (url, _request) = serve_once("500 Internal Server Error").await;
    let notifier = WebhookNotifier::new(url, Duration::from_secs(5));

    let err = notifier.notify(&alert(0)).await.expect_err("should fail");
    assert!(matches!(err, DispatchError::Status { status: 500 }));
}

#[tokio::test]
async fn connection_refused_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let notifier = WebhookNotifier::new(format!("http://{addr}/hook"), Duration::from_secs(5));
    let err = notifier.notify(&alert(0)).await.expect_err("should fail");
    assert!(matches!(err, DispatchError::Transport(_)));
}

#[tokio::test]
async fn hanging_endpoint_is_bounded_by_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        // Accept and hold the connection without answering.
        if let Ok((socket, _)) = listener.accept().await {
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        }
    });

    let notifier = WebhookNotifier::new(format!("http://{addr}/hook"), Duration::from_millis(300));
    let started = std::time::Instant::now();
    let err = notifier.notify(&alert(0)).await.expect_err("should time out");
    assert!(matches!(err, DispatchError::Transport(ref e) if e.is_timeout()));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn dispatch_swallows_failures() {
    let (url, _request) = serve_once("503 Service Unavailable").await;
    let notifier = WebhookNotifier::new(url, Duration::from_secs(5));
    assert!(!dispatch(&notifier, &alert(0)).await);
}
