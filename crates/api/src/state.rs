//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use costscope_billing::BillingService;

use crate::auth::JwtManager;
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let jwt_manager = JwtManager::new(&config.jwt_secret);

        let billing = BillingService::from_env(pool.clone())
            .map(Arc::new)
            .map_err(|e| anyhow::anyhow!("billing service initialization failed: {}", e))?;
        tracing::info!("Billing service initialized");

        Ok(Self {
            pool,
            config,
            jwt_manager,
            billing,
        })
    }
}
