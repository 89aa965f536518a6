use bytes::Bytes;
use futures_util::future::join_all;
use http::{header::CONTENT_TYPE, Method, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn, Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
};
use std::{convert::Infallible, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stackdriver_exporter::{
    api::{Authorizer, HttpMonitoringClient, StaticTokenAuthorizer},
    exposition, Config, MonitoringCollector,
};

struct AppState {
    collectors: Vec<MonitoringCollector>,
    telemetry_path: String,
}

async fn serve_metrics(state: &AppState) -> Response<Full<Bytes>> {
    let scrapes = join_all(state.collectors.iter().map(|c| c.collect())).await;

    let response = match exposition::encode_text(scrapes.into_iter().flatten()) {
        Ok((content_type, body)) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(Bytes::from(body))),
        Err(err) => {
            error!(name: "EncodeMetricsFailed", error = %err);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from(err.to_string())))
        }
    };
    response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

async fn router(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, path) if path == state.telemetry_path => serve_metrics(&state).await,
        (&Method::GET, "/") => Response::new(Full::new(Bytes::from(format!(
            "<html><head><title>Stackdriver Exporter</title></head><body>\
             <h1>Stackdriver Exporter</h1><p><a href=\"{}\">Metrics</a></p>\
             </body></html>",
            state.telemetry_path
        )))),
        _ => {
            let mut not_found = Response::new(Full::new(Bytes::from_static(b"Not Found")));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };
    Ok(response)
}

fn init_logging() {
    // RUST_LOG overrides the default; hyper and reqwest stay quiet unless asked.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info")
            .add_directive("hyper=error".parse().unwrap())
            .add_directive("reqwest=error".parse().unwrap())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn authorizer(config: &Config) -> stackdriver_exporter::Result<Arc<dyn Authorizer>> {
    if let Some(token) = &config.access_token {
        return Ok(Arc::new(StaticTokenAuthorizer::new(token)?));
    }

    #[cfg(feature = "gcp-authorizer")]
    {
        Ok(Arc::new(
            stackdriver_exporter::api::GcpAuthorizer::new().await?,
        ))
    }
    #[cfg(not(feature = "gcp-authorizer"))]
    {
        Err(stackdriver_exporter::Error::Config(
            "STACKDRIVER_EXPORTER_ACCESS_TOKEN must be set when built without gcp-authorizer"
                .to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();

    let config = Config::from_env()?;
    info!(name: "StartingExporter", config = ?config);

    let client = Arc::new(HttpMonitoringClient::new(
        config.api_endpoint.clone(),
        config.http_timeout,
        authorizer(&config).await?,
    )?);

    let collectors = config
        .project_ids
        .iter()
        .map(|project_id| {
            MonitoringCollector::builder(project_id.clone(), client.clone())
                .with_options(config.collector.clone())
                .build()
        })
        .collect::<stackdriver_exporter::Result<Vec<_>>>()?;

    let state = Arc::new(AppState {
        collectors,
        telemetry_path: config.telemetry_path.clone(),
    });

    let listener = TcpListener::bind(config.listen_address).await?;
    info!(
        name: "Listening",
        address = %config.listen_address,
        path = %config.telemetry_path
    );

    loop {
        let (stream, _addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!(name: "ShuttingDown", message = "received interrupt, stopping");
                return Ok(());
            }
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let service = service_fn(move |req| router(req, Arc::clone(&state)));
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                error!(name: "ServeConnectionFailed", error = %err);
            }
        });
    }
}
