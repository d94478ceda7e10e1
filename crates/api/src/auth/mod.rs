//! Bearer-token authentication
//!
//! Session issuance lives in the external auth service; this server only
//! verifies the HS256 session token and resolves the acting user id.

mod middleware;

pub use middleware::{require_auth, AuthUser, JwtManager};

#[cfg(test)]
mod middleware_tests;
