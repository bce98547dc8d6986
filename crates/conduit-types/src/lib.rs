mod event;
mod message;
mod provider;
mod stream;
mod tool;

pub use event::*;
pub use message::*;
pub use provider::*;
pub use stream::*;
pub use tool::*;
