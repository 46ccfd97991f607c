use std::sync::Arc;

use db::DBService;
use services::services::{storage::ObjectStore, transform::TransformService};
use utils_jwt::TokenService;

pub mod error;
pub mod middleware;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub db: DBService,
    pub store: Arc<dyn ObjectStore>,
    pub tokens: Arc<TokenService>,
    pub transform: TransformService,
}
