//! Producer handoff to interrupt context
//!
//! The DMA transfer interrupt has no way to receive the session's
//! [`Producer`] as an argument, so the session parks it in a `static`
//! [`TransferHandoff`] for the duration of the capture.
//!
//! # Example
//!
//! ```no_run
//! use moth_core::filter::DecimatingFilter;
//! use moth_core::handoff::TransferHandoff;
//!
//! static HANDOFF: TransferHandoff<DecimatingFilter> = TransferHandoff::new();
//!
//! // In the DMA complete interrupt:
//! fn on_dma_complete(raw: &[i16]) {
//!     HANDOFF.on_transfer(raw);
//! }
//! ```

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::filter::DigitalFilter;
use crate::pool::Producer;

/// Interrupt-safe slot for the active producer
pub struct TransferHandoff<F> {
    producer: Mutex<CriticalSectionRawMutex, RefCell<Option<Producer<F>>>>,
}

impl<F: DigitalFilter> TransferHandoff<F> {
    pub const fn new() -> Self {
        Self {
            producer: Mutex::new(RefCell::new(None)),
        }
    }

    /// Makes `producer` the target of subsequent transfers
    pub fn install(&self, producer: Producer<F>) {
        self.producer
            .lock(|cell| *cell.borrow_mut() = Some(producer));
    }

    /// Removes the producer; later transfers are dropped
    pub fn take(&self) -> Option<Producer<F>> {
        self.producer.lock(|cell| cell.borrow_mut().take())
    }

    pub fn is_installed(&self) -> bool {
        self.producer.lock(|cell| cell.borrow().is_some())
    }

    /// Feeds one raw transfer to the installed producer.
    ///
    /// Returns whether the amplitude threshold was exceeded, `false` when no
    /// producer is installed.
    pub fn on_transfer(&self, raw: &[i16]) -> bool {
        self.producer.lock(|cell| {
            cell.borrow_mut()
                .as_mut()
                .is_some_and(|producer| producer.produce(raw))
        })
    }
}

impl<F: DigitalFilter> Default for TransferHandoff<F> {
    fn default() -> Self {
        Self::new()
    }
}
