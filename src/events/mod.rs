pub mod guild;
pub mod message;

pub use guild::{handle_guild_create, handle_member_add};
pub use message::handle_message;
