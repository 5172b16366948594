// Public library interface for flashdeck
//
// The server binary and the watch client both build on these modules: the
// registry, image cache and flash orchestrator run in the server, the
// poller and HTTP client in the watcher, and the models are shared.

pub mod api;
pub mod client;
pub mod config;
pub mod devices;
pub mod error;
pub mod flash;
pub mod images;
pub mod logging;
pub mod models;
pub mod poller;
pub mod task;

pub use error::{ConsoleError, Result};
