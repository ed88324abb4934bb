//! Process-internal message bus.
//!
//! Every actor owns one bounded mailbox; senders hold a cloneable
//! [`Address`]. Sends never block: the only failure modes are a full
//! mailbox (back-pressure) and a hung-up receiver. Messages from one sender
//! to one destination are delivered in send order; nothing is guaranteed
//! across senders.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("mailbox '{0}' is full")]
    QueueFull(&'static str),
    #[error("mailbox '{0}' is closed")]
    Closed(&'static str),
}

/// Sending half of an actor's mailbox.
#[derive(Debug)]
pub struct Address<T> {
    name: &'static str,
    tx: Sender<T>,
}

impl<T> Clone for Address<T> {
    fn clone(&self) -> Self {
        Address { name: self.name, tx: self.tx.clone() }
    }
}

impl<T> Address<T> {
    pub fn send(&self, msg: T) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull(self.name),
            TrySendError::Disconnected(_) => SendError::Closed(self.name),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Create an actor mailbox; the receiver goes to the actor thread, the
/// address to everyone who talks to it.
pub fn mailbox<T>(name: &'static str, capacity: usize) -> (Address<T>, Receiver<T>) {
    let (tx, rx) = bounded(capacity);
    (Address { name, tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_sender() {
        let (addr, rx) = mailbox::<u32>("t", 16);
        for i in 0..10 {
            addr.send(i).unwrap();
        }
        let got: Vec<u32> = rx.try_iter().collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn full_mailbox_reports_queue_full() {
        let (addr, _rx) = mailbox::<u32>("small", 2);
        addr.send(1).unwrap();
        addr.send(2).unwrap();
        assert_eq!(addr.send(3), Err(SendError::QueueFull("small")));
    }

    #[test]
    fn closed_mailbox_reports_closed() {
        let (addr, rx) = mailbox::<u32>("gone", 2);
        drop(rx);
        assert_eq!(addr.send(1), Err(SendError::Closed("gone")));
    }
}
