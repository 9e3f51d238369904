//! Bearer token providers for the signaling requests

mod token;

pub use token::{RefreshPlan, RefreshingToken, StaticToken, TokenProvider};
