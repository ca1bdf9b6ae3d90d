//! SSH server implementation

mod channels;
mod handler;
mod listener;

pub use handler::{ConnectionHandler, ServerConfig};
pub use listener::{load_or_generate_host_key, SshServer};
