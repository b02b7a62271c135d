//! Notification bus towards the GUI or any other listener.
//!
//! Listeners implement [`Notify`]. Calls are made from the controller thread
//! (`run_status_changed`) and from the wait-monitor thread (`wait_completed`,
//! `all_waits_finished`), so implementations must be cheap and must not block.
//! [`ChannelNotify`] forwards everything into a crossbeam channel that the listener
//! drains at its own pace.

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::trace;

use crate::controller::RunState;

pub trait Notify: Send + Sync {
    fn wait_completed(&self, label: &str);
    fn all_waits_finished(&self);
    fn run_status_changed(&self, device: &str, state: RunState);
}

/// Discards every notification
pub struct NullNotify;

impl Notify for NullNotify {
    fn wait_completed(&self, _label: &str) {}
    fn all_waits_finished(&self) {}
    fn run_status_changed(&self, _device: &str, _state: RunState) {}
}

#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    WaitCompleted(String),
    AllWaitsFinished,
    RunStatusChanged { device: String, state: RunState },
}

/// Forwards notifications into a channel
pub struct ChannelNotify {
    sendr: Sender<Notification>,
}

impl ChannelNotify {
    pub fn new() -> (Self, Receiver<Notification>) {
        let (sendr, recvr) = unbounded();
        (Self { sendr }, recvr)
    }

    fn forward(&self, note: Notification) {
        // A listener that went away is not an error for the hardware side
        if self.sendr.send(note).is_err() {
            trace!("Notification listener disconnected");
        }
    }
}

impl Notify for ChannelNotify {
    fn wait_completed(&self, label: &str) {
        self.forward(Notification::WaitCompleted(label.to_string()));
    }
    fn all_waits_finished(&self) {
        self.forward(Notification::AllWaitsFinished);
    }
    fn run_status_changed(&self, device: &str, state: RunState) {
        self.forward(Notification::RunStatusChanged {
            device: device.to_string(),
            state,
        });
    }
}
