//! The lifecycle state shared by connections and channels.

use tokio::sync::watch;

/// `Closed -> Opening -> Open -> Closing -> Closed`, monotonic per lifetime.
/// Connections and channels share this set (see `DESIGN.md`): a channel's
/// states mean the same thing as a connection's, just scoped to one
/// multiplexed stream instead of the whole transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Opening,
    Open,
    Closing,
}

pub fn watch_channel(initial: State) -> (watch::Sender<State>, watch::Receiver<State>) {
    watch::channel(initial)
}
