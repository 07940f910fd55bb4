pub mod channel;
pub mod record;
