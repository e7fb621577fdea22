pub mod types;

pub use types::{JobId, UserId};
