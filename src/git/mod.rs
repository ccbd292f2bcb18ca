pub mod commands;
pub mod pack;
pub mod pktline;
pub mod repository;

pub use commands::Git;
pub use pack::{PostReceiveHook, ReceivePack, Service, StatelessRpc, UploadPack};
pub use repository::Repository;
