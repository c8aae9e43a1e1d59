pub mod cooldown;
pub mod extract;
pub mod session_key;
pub mod tickets;
