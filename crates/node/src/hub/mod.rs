mod channel;

pub use channel::{ChannelError, CommandHandler, HubChannel, MAX_FRAME_BYTES};
