//! 文件存储后端
//!
//! 服务端把每个对象保存为一个数据文件，写批次先记入恢复日志；
//! 客户端通过行协议访问，既可以走 TCP，也可以在进程内直接调用。
//!
mod client;
mod locks;
pub mod protocol;
mod server;

pub use client::{FileConnection, FileConnectionFactory, LocalTransport, TcpTransport, Transport};
pub use locks::{LockManager, ReadGuard, WriteGuard};
pub use server::{FileServer, ServerHandle};
