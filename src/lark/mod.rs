//! Lark / Feishu open platform: inbound event decoding and outbound API.

pub mod api;
pub mod crypto;
pub mod event;
pub mod message;
pub mod token;
pub mod user;
pub mod validator;
