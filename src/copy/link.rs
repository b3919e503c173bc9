//! Outbound side of a peer connection, as seen by the protocol endpoints.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::core::errors::{MirrorError, Result};

/// Something that delivers messages of type `M` to the remote peer.
pub trait PeerLink<M>: Send + Sync {
    fn send(&self, message: &M) -> Result<()>;
}

impl<M, L: PeerLink<M> + ?Sized> PeerLink<M> for Arc<L> {
    fn send(&self, message: &M) -> Result<()> {
        (**self).send(message)
    }
}

/// In-process link: every sent message lands on a channel.
pub struct ChannelLink<M> {
    tx: Sender<M>,
}

impl<M> ChannelLink<M> {
    /// Link plus the receiving end the "peer" reads from.
    pub fn pair() -> (Self, Receiver<M>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl<M: Clone + Send> PeerLink<M> for ChannelLink<M> {
    fn send(&self, message: &M) -> Result<()> {
        self.tx
            .send(message.clone())
            .map_err(|_| MirrorError::ChannelClosed {
                component: "channel link",
            })
    }
}
