//! End-to-end tunnel scenarios over real TCP: a reverse server on an
//! ephemeral port, a reverse client polling it with reqwest, and
//! originators submitting requests from the server's on-connect callback.

use std::future::IntoFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::{self, Next};
use bytes::Bytes;
use http::{HeaderValue, Request, StatusCode};
use revhttp::{connect_and_serve, ResponseWriter, ReverseServer, ServerConfig, Session};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Bind an ephemeral port, serve `app`, and return the base URL.
async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());
    format!("http://{addr}/")
}

fn frob(body: &'static [u8]) -> Request<Bytes> {
    Request::builder()
        .method("FROB")
        .uri("/grob")
        .body(Bytes::from_static(body))
        .unwrap()
}

#[tokio::test]
async fn round_trips_two_requests_through_the_tunnel() {
    init_logging();
    let (resp_tx, mut resp_rx) = mpsc::channel(2);
    let server = ReverseServer::builder()
        .on_connect(move |session: Arc<Session>| {
            let resp_tx = resp_tx.clone();
            async move {
                for _ in 0..2 {
                    let result = session.submit(frob(b"frob the grob!")).await;
                    resp_tx.send(result).await.unwrap();
                }
            }
        })
        .build();
    let url = serve(server.router()).await;

    let http = reqwest::Client::new();
    tokio::spawn(async move {
        let _ = connect_and_serve(
            &http,
            &url,
            |request: Request<Bytes>, mut response: ResponseWriter| async move {
                assert_eq!(request.method().as_str(), "FROB");
                assert_eq!(request.uri().path(), "/grob");
                assert_eq!(request.body().as_ref(), b"frob the grob!");
                response
                    .headers_mut()
                    .insert("x-foo", HeaderValue::from_static("Bar"));
                response.write("asdf asdf asdf").unwrap();
            },
        )
        .await;
    });

    for _ in 0..2 {
        let response = timeout(WAIT, resp_rx.recv()).await.unwrap().unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-foo").unwrap(), "Bar");
        assert_eq!(response.body().as_ref(), b"asdf asdf asdf");
    }
}

#[tokio::test]
async fn clamped_long_poll_keeps_the_client_polling() {
    init_logging();
    let (resp_tx, mut resp_rx) = mpsc::channel(1);
    let server = ReverseServer::builder()
        .config(ServerConfig {
            long_poll_max_timeout_ms: 50,
            ..ServerConfig::default()
        })
        .on_connect(move |session: Arc<Session>| {
            let resp_tx = resp_tx.clone();
            async move {
                // Stay quiet long enough that the client has to sit through
                // several empty polls before any work shows up.
                sleep(Duration::from_millis(150)).await;
                let result = session.submit(frob(b"")).await;
                resp_tx.send(result).await.unwrap();
            }
        })
        .build();

    let empty_polls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&empty_polls);
    let app = server.router().layer(middleware::from_fn(
        move |request: axum::extract::Request, next: Next| {
            let counter = Arc::clone(&counter);
            async move {
                let response = next.run(request).await;
                if response.status() == StatusCode::NO_CONTENT {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                response
            }
        },
    ));
    let url = serve(app).await;

    let http = reqwest::Client::new();
    tokio::spawn(async move {
        let _ = connect_and_serve(
            &http,
            &url,
            |_request: Request<Bytes>, mut response: ResponseWriter| async move {
                response.write("Hello, World!").unwrap();
            },
        )
        .await;
    });

    let response = timeout(WAIT, resp_rx.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let seen = empty_polls.load(Ordering::SeqCst);
    assert!(seen >= 3, "expected at least three empty polls, saw {seen}");
}

#[tokio::test]
async fn handler_error_status_passes_through() {
    init_logging();
    let (resp_tx, mut resp_rx) = mpsc::channel(1);
    let server = ReverseServer::builder()
        .on_connect(move |session: Arc<Session>| {
            let resp_tx = resp_tx.clone();
            async move {
                let request = Request::builder()
                    .method("FAIL")
                    .uri("/grob")
                    .body(Bytes::new())
                    .unwrap();
                let result = session.submit(request).await;
                resp_tx.send(result).await.unwrap();
            }
        })
        .build();
    let url = serve(server.router()).await;

    let http = reqwest::Client::new();
    tokio::spawn(async move {
        let _ = connect_and_serve(
            &http,
            &url,
            |_request: Request<Bytes>, mut response: ResponseWriter| async move {
                response.write_head(StatusCode::IM_A_TEAPOT);
            },
        )
        .await;
    });

    let response = timeout(WAIT, resp_rx.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn server_side_close_fails_submit_and_terminates_client() {
    init_logging();
    let (submit_tx, mut submit_rx) = mpsc::channel(1);
    let server = ReverseServer::builder()
        .on_connect(move |session: Arc<Session>| {
            let submit_tx = submit_tx.clone();
            async move {
                session.close().await;
                let result = session.submit(frob(b"")).await;
                submit_tx.send(result).await.unwrap();
            }
        })
        .build();
    let url = serve(server.router()).await;

    let http = reqwest::Client::new();
    let client = tokio::spawn(async move {
        connect_and_serve(
            &http,
            &url,
            |_request: Request<Bytes>, mut response: ResponseWriter| async move {
                response.write_head(StatusCode::OK);
            },
        )
        .await
    });

    let result = timeout(WAIT, submit_rx.recv()).await.unwrap().unwrap();
    assert!(result.unwrap_err().is_session_closed());

    let client_result = timeout(WAIT, client).await.unwrap().unwrap();
    assert!(client_result.unwrap_err().is_session_closed());
}

#[tokio::test]
async fn idle_timeout_evicts_the_session() {
    init_logging();
    let server = ReverseServer::builder()
        .config(ServerConfig {
            session_idle_timeout_ms: 50,
            ..ServerConfig::default()
        })
        .on_connect(|session: Arc<Session>| async move {
            // The reply may arrive late or fail once the idle timer fires;
            // only the client-side termination matters in this scenario.
            let _ = session.submit(frob(b"")).await;
        })
        .build();
    let url = serve(server.router()).await;

    let http = reqwest::Client::new();
    let client = tokio::spawn(async move {
        connect_and_serve(
            &http,
            &url,
            |_request: Request<Bytes>, mut response: ResponseWriter| async move {
                // Outlive the idle timeout while the next poll's body is
                // still streaming.
                sleep(Duration::from_millis(150)).await;
                response.write_head(StatusCode::IM_A_TEAPOT);
            },
        )
        .await
    });

    let result = timeout(WAIT, client).await.unwrap().unwrap();
    assert!(result.unwrap_err().is_session_closed());
}

#[tokio::test]
async fn timeout_values_are_validated_and_clamped() {
    init_logging();
    let server = ReverseServer::new(ServerConfig {
        long_poll_min_timeout_ms: 50,
        long_poll_max_timeout_ms: 150,
        ..ServerConfig::default()
    });
    let url = serve(server.router()).await;
    let http = reqwest::Client::new();

    let bad = http
        .post(&url)
        .header("x-timeout", "not-a-valid-time")
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        bad.headers().get("x-error").unwrap(),
        "cannot parse duration in X-Timeout header"
    );
    assert!(bad.headers().contains_key("x-session"));

    let high = http
        .post(&url)
        .header("x-timeout", "200ms")
        .send()
        .await
        .unwrap();
    assert_eq!(high.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        high.headers().get("x-warning").unwrap(),
        "timeout value too high, forcing to maximum 150ms"
    );

    let low = http
        .post(&url)
        .header("x-timeout", "10ms")
        .send()
        .await
        .unwrap();
    assert_eq!(low.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        low.headers().get("x-warning").unwrap(),
        "timeout value too low, forcing to minimum 50ms"
    );
}
