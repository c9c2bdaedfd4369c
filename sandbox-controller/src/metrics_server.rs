//! Minimal `/metrics` endpoint, hand-rolled on `hyper` directly (no web
//! framework) since this binary serves exactly one route.
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, body::Incoming, service::service_fn};
use hyper_util::{rt::TokioIo, server::conn::auto::Builder};
use owo_colors::OwoColorize;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub async fn run(port: u16, registry: &'static Registry) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", format!("🛑 failed to bind metrics server to {addr}: {e}").red());
            return;
        }
    };
    println!("{}", format!("📈 Starting metrics server • port={port}").green());

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("metrics server accept error: {e}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, registry));
            if let Err(e) = Builder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                eprintln!("metrics server connection error: {e}");
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    registry: &'static Registry,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(404)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap());
    }
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return Ok(Response::builder()
            .status(500)
            .body(Full::new(Bytes::from_static(b"encode error")))
            .unwrap());
    }
    Ok(Response::new(Full::new(Bytes::from(buffer))))
}
