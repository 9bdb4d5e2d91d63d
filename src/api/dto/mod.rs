//! Data Transfer Objects for request parsing.

pub mod stream_dto;

pub use stream_dto::StreamQuery;
