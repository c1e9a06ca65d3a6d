pub mod conn;
pub mod handler;
