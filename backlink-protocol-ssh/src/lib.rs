mod console;
mod keys;
mod server;
mod stream;

pub use keys::load_host_key;
pub use server::{run_server, SshRelay};
pub use stream::{DeadlineControl, DeadlineStream};
