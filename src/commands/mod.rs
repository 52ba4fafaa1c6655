pub mod config;
pub mod general;
pub mod verify;

pub use config::{disableonjoin, domainadd, domainremove, enableonjoin, rolechange};
pub use general::{ping, vstatus};
pub use verify::verify;
