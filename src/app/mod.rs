mod app_tests;
mod rpc;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};

use self::state::HoardState;

/// Return a fully-functional hoard tool server! The caller is in charge of
/// building the state; everything interesting hangs off the one rpc route.
pub fn hoard_app(state: HoardState) -> Router {
    Router::new()
        .route("/rpc", post(rpc::handle))
        .route("/healthz", get(rpc::healthz))
        .with_state(state)
}
