pub mod reconciler;
pub mod reload;
pub mod server;
pub mod session;

pub use reload::{RELOAD_PATH, register_reload_fanout};
pub use server::{GatewayState, build_router, reset_connection_flags, start_server};
