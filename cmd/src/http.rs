use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use color_eyre::eyre::WrapErr;
use promagg::AggregateStore;
use tower_http::trace::{self, TraceLayer};
use tracing::Level;

use super::{api, Cli};

pub struct AppState {
    pub store: AggregateStore,
    pub cors: HeaderValue,
    pub by_job: bool,
}

pub async fn serve(cli: Cli, store: AggregateStore) -> color_eyre::Result<()> {
    let cors = cli
        .cors
        .parse::<HeaderValue>()
        .wrap_err("invalid --cors value")?;
    let state = Arc::new(AppState {
        store,
        cors,
        by_job: cli.by_job,
    });

    let push_path = cli.push_path.trim_end_matches('/');
    let app = Router::new()
        .route("/metrics", get(api::scrape))
        .route(push_path, post(api::push_root).put(api::push_root))
        .route(
            &format!("{push_path}/*suffix"),
            post(api::push).put(api::push),
        )
        .route("/-/healthy", get(api::healthy))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        );

    tracing::info!("start http server: {:?}", cli.listen);
    axum::Server::bind(&cli.listen)
        .serve(app.into_make_service())
        .await
        .wrap_err("http server failed")
}
