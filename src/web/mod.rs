pub mod server;

pub use server::start_health_server;
