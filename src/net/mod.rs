//! Backend access: wire types, errors, and the reqwest client.

pub mod api;
pub mod error;
pub mod types;

pub use api::{AnswerRequest, ChatApi, HistoryQuery, HttpApi};
pub use error::ApiError;
