//! Administrative authentication and authorization.
//!
//! Bearer credentials are HS256 JWTs carrying the principal's capabilities.
//! Every mutating operation receives an [`Actor`] and checks the capability it
//! needs before touching storage.

pub mod claims;
pub mod jwt;
pub mod principal;

pub use claims::Claims;
pub use jwt::JwtManager;
pub use principal::{Actor, AuthError, Capability, Principal};
