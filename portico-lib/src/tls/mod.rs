pub mod acceptor;
pub mod info;

pub use acceptor::{build_backend_connector, fnmatch, TlsServer};
pub use info::TlsInfo;
