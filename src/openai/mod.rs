mod core;
pub use self::core::*;
mod stream;
pub use stream::{SseDecoder, StreamDelta, decode_stream, with_idle_timeout};
