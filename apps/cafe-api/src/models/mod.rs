pub mod analytics;
pub mod badge;
pub mod cafe;
pub mod dm_channel;
pub mod message;
pub mod poke;
