//! HTTP surface: the worker work API and a read-only jobs API.
//!
//! Workers poll `GET /work?serviceID=...` and report with `PUT /work/:id`.
//! Orchestration stays in the service layer; handlers only translate.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::services::{CoreContext, Dispatcher, Orchestrator, UpdateProcessor};

/// Shared state for the work API server.
#[derive(Clone)]
pub struct AppState {
    pub ctx: CoreContext,
    pub orchestrator: Orchestrator,
    pub dispatcher: Arc<Dispatcher>,
    pub updater: Arc<UpdateProcessor>,
}

impl AppState {
    pub fn new(ctx: CoreContext) -> Self {
        Self {
            orchestrator: Orchestrator::new(ctx.clone()),
            dispatcher: Arc::new(Dispatcher::new(ctx.clone())),
            updater: Arc::new(UpdateProcessor::new(ctx.clone())),
            ctx,
        }
    }
}

/// Start the work API server.
pub async fn serve(ctx: CoreContext, host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState::new(ctx);
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting work API at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
