//! Run a programming session on a background thread

use std::thread::{self, JoinHandle};

use embedded_hal::blocking::delay::DelayMs;

use crate::image::ImageSource;
use crate::progress::Observer;
use crate::{Error, Programmer, SerialPort};

/// Programmer handed back by a finished session, along with its outcome
pub type Finished<P, D, E> = (Programmer<P, D, E>, Result<(), Error<E>>);

/// Spawn a thread running [`Programmer::run`].
///
/// The observer is called from the spawned thread. Joining the handle returns
/// the programmer so the port can be recovered with [`Programmer::release`].
pub fn spawn<P, D, E, S, O>(
    mut programmer: Programmer<P, D, E>,
    image: S,
    observer: O,
) -> JoinHandle<Finished<P, D, E>>
where
    P: SerialPort<E> + Send + 'static,
    D: DelayMs<u32> + Send + 'static,
    E: core::fmt::Debug + Send + 'static,
    S: ImageSource + Send + 'static,
    O: Observer<E> + Send + 'static,
{
    thread::spawn(move || {
        let outcome = programmer.run(image, observer);
        (programmer, outcome)
    })
}
