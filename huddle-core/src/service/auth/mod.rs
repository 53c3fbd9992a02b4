//! Connection identity verification

pub mod jwt;

pub use jwt::{Claims, IdentityVerifier, JwtVerifier};
