pub mod handler;
pub mod response;

pub use handler::{download_test, list_exercises};
