pub mod backend;
pub mod ftp;
pub mod local;
pub mod ssh;

pub use backend::{
    create_adapter, Credentials, Protocol, RemoteStat, TransportAdapter, TransportTarget,
};
pub use ftp::FtpTransport;
pub use local::LocalTransport;
pub use ssh::SshTransport;
