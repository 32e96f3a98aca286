//! Business logic services.
//!
//! # Services
//!
//! - `tokens` - Ephemeral token generation, session signing and verification
//! - `registration` - Registration and email confirmation
//! - `reset` - Forgot-password and password reset
//! - `auth` - Password and federated login, password change, profile
//! - `cart` - Open cart, checkout and order status
//! - `sweep` - Background reclamation of abandoned registrations
//! - `email` - Transactional email rendering and delivery
//! - `google` - Google OAuth client
//! - `clock` - Injected time source

pub mod auth;
pub mod cart;
pub mod clock;
pub mod email;
pub mod google;
pub mod registration;
pub mod reset;
pub mod sweep;
pub mod tokens;
