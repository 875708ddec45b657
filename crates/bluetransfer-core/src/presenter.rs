//! Callback interface towards the presentation layer.
//!
//! The engine never blocks on the presentation layer: every callback is
//! invoked from a background task and must return promptly. Implementations
//! that need to do real work should hand the event off, which is what
//! [`ChannelPresenter`] does.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::protocol::TransferId;
use crate::transfer::TransferSnapshot;

/// Receives engine events.
pub trait Presenter: Send + Sync + 'static {
    /// A peer offered a file. Answer with
    /// [`Engine::accept_transfer`](crate::Engine::accept_transfer) or
    /// [`Engine::reject_transfer`](crate::Engine::reject_transfer).
    fn present_incoming_transfer_request(&self, transfer: TransferSnapshot);

    /// The peer declined one of our offers.
    fn present_rejected_transfer(&self, transfer: TransferSnapshot);

    /// Periodic snapshot of every watched transfer.
    fn sync_transfers_to_ui(&self, transfers: HashMap<TransferId, TransferSnapshot>);

    /// A background task hit an error.
    fn exception_happened(&self, error: Error);
}

/// Event forwarded by [`ChannelPresenter`].
#[derive(Debug)]
pub enum PresenterEvent {
    /// See [`Presenter::present_incoming_transfer_request`]
    IncomingRequest(TransferSnapshot),
    /// See [`Presenter::present_rejected_transfer`]
    Rejected(TransferSnapshot),
    /// See [`Presenter::sync_transfers_to_ui`]
    Sync(HashMap<TransferId, TransferSnapshot>),
    /// See [`Presenter::exception_happened`]
    Exception(Error),
}

/// Forwards every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<PresenterEvent>,
}

impl ChannelPresenter {
    /// Create a presenter and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PresenterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: PresenterEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Presenter channel closed, dropping event");
        }
    }
}

impl Presenter for ChannelPresenter {
    fn present_incoming_transfer_request(&self, transfer: TransferSnapshot) {
        self.forward(PresenterEvent::IncomingRequest(transfer));
    }

    fn present_rejected_transfer(&self, transfer: TransferSnapshot) {
        self.forward(PresenterEvent::Rejected(transfer));
    }

    fn sync_transfers_to_ui(&self, transfers: HashMap<TransferId, TransferSnapshot>) {
        self.forward(PresenterEvent::Sync(transfers));
    }

    fn exception_happened(&self, error: Error) {
        self.forward(PresenterEvent::Exception(error));
    }
}
