// Readiness waitables (wasi:io/poll)
//
// `TcpSocket::subscribe` hands out a `Pollable` that reports when a
// pending `finish_connect` or an `accept` can make progress. Sockets in
// any other state return an immediately-ready pollable.

use alloc::vec::Vec;

use crate::loopback::LoopbackNetwork;

#[cfg(all(feature = "std", unix))]
use alloc::sync::Arc;

// ---------------------------------------------------------------------------
// Pollable State
// ---------------------------------------------------------------------------

/// The internal state of a `Pollable` resource.
#[derive(Clone)]
pub(crate) enum PollableState {
    /// Always ready.
    Immediate,
    /// Ready once the loopback clock reaches `ready_at`.
    LoopbackTick { net: LoopbackNetwork, ready_at: u64 },
    /// Ready when the loopback listener has an acceptable connection.
    LoopbackListener { net: LoopbackNetwork, id: u64 },
    /// Ready when `poll(2)` reports `events` on the socket.
    #[cfg(all(feature = "std", unix))]
    Os {
        socket: Arc<socket2::Socket>,
        events: i16,
    },
}

/// A readiness waitable.
#[derive(Clone)]
pub struct Pollable {
    state: PollableState,
}

impl Pollable {
    pub(crate) fn new(state: PollableState) -> Self {
        Self { state }
    }

    pub fn immediate() -> Self {
        Self::new(PollableState::Immediate)
    }

    /// Check readiness without waiting.
    pub fn ready(&self) -> bool {
        match &self.state {
            PollableState::Immediate => true,
            PollableState::LoopbackTick { net, ready_at } => net.now() >= *ready_at,
            PollableState::LoopbackListener { net, id } => net.is_listener_ready(*id),
            #[cfg(all(feature = "std", unix))]
            PollableState::Os { socket, events } => crate::os::poll_fd(socket, *events, 0),
        }
    }

    /// Wait until the pollable is ready.
    ///
    /// On the loopback host nothing runs concurrently, so blocking
    /// advances the simulated clock instead of waiting. A listener with an
    /// empty queue can never become ready that way and returns at once.
    pub fn block(&self) {
        match &self.state {
            PollableState::Immediate => {}
            PollableState::LoopbackTick { net, ready_at } => net.advance_to(*ready_at),
            PollableState::LoopbackListener { net, id } => match net.listener_wakeup(*id) {
                Some(tick) => net.advance_to(tick),
                None => log::trace!("[KPIO Sockets] block on idle loopback listener {}", id),
            },
            #[cfg(all(feature = "std", unix))]
            PollableState::Os { socket, events } => {
                crate::os::poll_fd(socket, *events, -1);
            }
        }
    }
}

impl core::fmt::Debug for Pollable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.state {
            PollableState::Immediate => write!(f, "Pollable::Immediate"),
            PollableState::LoopbackTick { ready_at, .. } => {
                write!(f, "Pollable::LoopbackTick({})", ready_at)
            }
            PollableState::LoopbackListener { id, .. } => {
                write!(f, "Pollable::LoopbackListener({})", id)
            }
            #[cfg(all(feature = "std", unix))]
            PollableState::Os { events, .. } => write!(f, "Pollable::Os({:#x})", events),
        }
    }
}

// ---------------------------------------------------------------------------
// Poll: poll a list of pollables
// ---------------------------------------------------------------------------

/// Return the indices of the pollables that are ready right now.
///
/// Never blocks; an empty result means nothing is ready yet.
pub fn poll_list(pollables: &[&Pollable]) -> Vec<u32> {
    pollables
        .iter()
        .enumerate()
        .filter(|(_, p)| p.ready())
        .map(|(i, _)| i as u32)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopbackConfig;

    #[test]
    fn immediate_pollable_is_ready() {
        assert!(Pollable::immediate().ready());
    }

    #[test]
    fn tick_pollable_waits_for_clock() {
        let net = LoopbackNetwork::new(LoopbackConfig::default());
        let pollable = Pollable::new(PollableState::LoopbackTick {
            net: net.clone(),
            ready_at: 3,
        });
        assert!(!pollable.ready());
        net.tick();
        assert!(!pollable.ready());
        pollable.block();
        assert!(pollable.ready());
        assert_eq!(net.now(), 3);
    }

    #[test]
    fn poll_list_partial_ready() {
        let net = LoopbackNetwork::new(LoopbackConfig::default());
        let a = Pollable::immediate();
        let b = Pollable::new(PollableState::LoopbackTick {
            net: net.clone(),
            ready_at: 10,
        });
        let c = Pollable::immediate();
        assert_eq!(poll_list(&[&a, &b, &c]), alloc::vec![0, 2]);
        net.advance(10);
        assert_eq!(poll_list(&[&a, &b, &c]), alloc::vec![0, 1, 2]);
    }

    #[test]
    fn poll_list_empty() {
        assert!(poll_list(&[]).is_empty());
    }
}
