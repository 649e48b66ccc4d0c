pub mod card;
pub mod client;
pub mod draft;
pub mod error;
pub mod send;
pub mod types;

pub use draft::DraftStreamer;
pub use error::TransportError;
pub use send::{edit_text_quiet, send_text_chunked};
pub use types::{Button, ChatTransport, InlineKeyboard, SendOptions};
