//! Authentication module for Billgate

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, JwtManager};
pub use middleware::{
    require_active_subscription, require_auth, AuthMethod, AuthState, AuthUser, AUTH_COOKIE_NAME,
    SUBSCRIPTION_REQUIRED_PATH,
};
