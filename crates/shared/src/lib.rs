pub mod chat_line;
pub mod domain;
pub mod error;
pub mod protocol;
