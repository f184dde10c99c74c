pub mod handler;
pub mod request;
pub mod response;

pub use handler::evaluate;
