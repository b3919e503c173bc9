//! Bounded-concurrency copy protocol between a content server and its
//! backup peer.

pub mod client;
pub mod link;
pub mod manager;
pub mod messages;
pub mod receiver;
pub mod server;
pub mod streamer;
pub mod transport;

pub use client::{ClientWorker, CopyClient};
pub use link::{ChannelLink, PeerLink};
pub use manager::{Admission, CopyManager, CopyState};
pub use messages::{ClientEvent, FileChunk, Metadata, ServerEvent, ToBackup, ToContentServer};
pub use receiver::{FileReceiver, Receipt};
pub use server::CopyServer;
pub use streamer::{FileStreamer, StreamEvent, Streamer};
pub use transport::{TcpClient, TcpServer};
