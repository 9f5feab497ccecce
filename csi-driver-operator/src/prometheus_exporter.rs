use std::net::SocketAddr;

use http_body_util::Full;
use hyper::{
    Request, Response,
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

fn serve_req(
    _req: Request<Incoming>,
    registry: &Registry,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    match encoder.encode(&metric_families, &mut result) {
        Ok(_) => Response::builder()
            .status(200)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Full::new(Bytes::from(result))),
        Err(e) => {
            error!("{}", e);
            Response::builder().status(500).body(Full::default())
        }
    }
}

async fn serve(listener: TcpListener, registry: Registry) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let registry = registry.clone();
                async move { serve_req(req, &registry) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection from {} failed: {}", peer, e);
            }
        });
    }
}

pub(crate) async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    serve(listener, registry).await?;
    Ok(())
}
