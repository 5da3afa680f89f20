pub mod api;
pub mod searches;
pub mod server;
