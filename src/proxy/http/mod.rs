pub mod codec;
mod pipeline;

pub use pipeline::{ConnectionHandler, Phase};
pub use pipeline::{redirect_response, send_response, status_response};
