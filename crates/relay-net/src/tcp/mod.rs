mod listener;
mod stream;

pub use listener::{PollEvent, ReactorHandle, SendBehavior, TcpReactor};
pub use mio::Token;
pub use stream::ConnState;
