//! Bearer token inspection.
//!
//! Access tokens are JWTs whose payload carries an `exp` claim. Only the
//! expiry is read here; signatures are the server's business.

pub mod codec;

pub use codec::decode_expiry;
