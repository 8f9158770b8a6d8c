mod server;
mod session;
mod tls;

pub use self::server::serve;
pub use self::session::{
    OutboundQueue, SESSION_NOTIFICATION_BOUND, SessionHandle, SessionRegistry,
};
