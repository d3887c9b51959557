use std::io;
use std::thread;

use crossbeam_channel::{bounded, never, Receiver, TrySendError};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

/// Installs the process-wide termination handler and returns the channel
/// every process-runner invocation listens on. The runner forwards a
/// received signal to its current child.
pub fn install() -> io::Result<Receiver<i32>> {
    let (sender, receiver) = bounded(4);
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        for signal in signals.forever() {
            match sender.try_send(signal) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    });
    Ok(receiver)
}

/// A channel that never delivers, for callers without signal handling.
pub fn none() -> Receiver<i32> {
    never()
}
