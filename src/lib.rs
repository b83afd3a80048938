use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    Extension, Router,
};
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

pub mod accounts;
pub mod achievements;
pub mod admins;
pub mod api;
pub mod auth;
pub mod clubs;
pub mod config;
pub mod email;
pub mod error;
pub mod events;
pub mod invitations;
pub mod models;
pub mod provisioning;
pub mod rbac;
pub mod roster;
pub mod schema;
pub mod stats;
pub mod storage;
pub mod types;

use crate::{auth::AuthKeys, config::AllowedHosts, email::Mailer, storage::StorageSettings};

pub type DbPool = Pool<AsyncPgConnection>;

pub fn connect_to_db(db_url: &str) -> anyhow::Result<DbPool> {
    let db_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Ok(Pool::builder(db_config).build()?)
}

/// The API under `/api`; uploaded media under `/media` for the local
/// storage backend.
pub fn app(pool: DbPool, keys: Arc<AuthKeys>, mailer: Mailer, storage: &StorageSettings) -> Router {
    let mut router = Router::new().nest("/api", api::app());
    if let StorageSettings::Local { root } = storage {
        router = router.nest_service("/media", ServeDir::new(root));
    }
    router
        .layer(Extension(pool))
        .layer(Extension(keys))
        .layer(Extension(mailer))
        .layer(TraceLayer::new_for_http())
}

pub fn cors_layer(hosts: &AllowedHosts) -> anyhow::Result<CorsLayer> {
    let origin = match hosts {
        AllowedHosts::Any => AllowOrigin::from(Any),
        AllowedHosts::List(hosts) => AllowOrigin::list(
            hosts
                .iter()
                .map(|host| host.parse::<HeaderValue>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| anyhow::anyhow!("ALLOWED_HOSTS contains an invalid origin: {e}"))?,
        ),
    };
    Ok(CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_origin(origin))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_accepts_wildcard_and_lists() {
        assert!(cors_layer(&AllowedHosts::Any).is_ok());
        assert!(cors_layer(&AllowedHosts::List(vec!["https://clubs.example.com".to_string()])).is_ok());
        assert!(cors_layer(&AllowedHosts::List(vec!["bad\norigin".to_string()])).is_err());
    }
}
