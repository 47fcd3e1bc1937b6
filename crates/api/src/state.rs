//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use billgate_billing::{BillingService, PgStore, SubscriptionStore};

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Issued tokens are validated here, not minted; the expiry only matters to
/// tokens generated in-process
const JWT_EXPIRY_HOURS: i64 = 24;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub store: Arc<dyn SubscriptionStore>,
    /// Billing service (None when Stripe is not configured)
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, JWT_EXPIRY_HOURS);

        // Try to initialize billing if Stripe env vars are set
        let billing = match BillingService::from_env(pool.clone(), &config.public_base_url) {
            Ok(svc) => {
                tracing::info!("Stripe billing service initialized");
                Some(Arc::new(svc))
            }
            Err(e) => {
                tracing::warn!("Stripe billing not configured: {}", e);
                None
            }
        };

        let store: Arc<dyn SubscriptionStore> = Arc::new(PgStore::new(pool));

        Self {
            config,
            jwt_manager,
            store,
            billing,
        }
    }

    /// Assemble from explicit parts (tests, alternative stores)
    pub fn from_parts(
        config: Config,
        store: Arc<dyn SubscriptionStore>,
        billing: Option<Arc<BillingService>>,
    ) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, JWT_EXPIRY_HOURS);
        Self {
            config,
            jwt_manager,
            store,
            billing,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            store: self.store.clone(),
        }
    }

    pub fn billing_service(&self) -> Option<&Arc<BillingService>> {
        self.billing.as_ref()
    }
}
