//! Chat transports implementing `Source` and `ActionSink`.

pub mod telegram;

pub use telegram::TelegramBot;
