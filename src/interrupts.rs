// Interrupt mailbox
// ISRs and driver callbacks run outside the control loop; they only flag what
// happened here and the loop acts on it at the start of its next tick. The
// mailbox holds one slot: the latest event wins, which is fine because both
// events are idempotent to handle.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptEvent {
    /// The factory reset button was held long enough: wipe all credentials.
    FactoryReset,
    /// The station got an IP through a path the loop did not drive; the
    /// active credentials may need persisting.
    ConnectionEstablished,
}

pub struct InterruptMailbox {
    signal: Signal<CriticalSectionRawMutex, InterruptEvent>,
}

impl InterruptMailbox {
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
        }
    }

    /// Callable from ISR context.
    pub fn raise(&self, event: InterruptEvent) {
        self.signal.signal(event);
    }

    /// Consumes the pending event, if any. Never blocks.
    pub fn take(&self) -> Option<InterruptEvent> {
        self.signal.try_take()
    }
}

pub static INTERRUPTS: InterruptMailbox = InterruptMailbox::new();
