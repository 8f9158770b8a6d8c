mod manager;
mod scan;

pub use self::manager::{ConnectionInfo, NetworkManager, PingOutcome, SendOutcome};
pub use self::scan::{ScanHit, ScanOptions, classify_port, scan_subnet};
