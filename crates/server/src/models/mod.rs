//! Domain models.
//!
//! These are validated domain objects, independent of how a store persists
//! them. Row types live next to the queries in [`crate::db`].

pub mod cart;
pub mod session;
pub mod subject;
pub mod token;

pub use cart::{Cart, CartItem, CartLine, CartView, Product};
pub use session::{CurrentSubject, SessionClaims};
pub use subject::{NewSubject, Subject, SubjectSummary};
pub use token::{EphemeralToken, NewToken};
