//! Lifecycle and progress reporting for programming sessions

use std::sync::mpsc::Sender;

use crate::{Error, State};

/// Receives session events, called synchronously from the session thread
pub trait Observer<E> {
    fn on_start(&mut self) {}

    /// Called on every session state transition
    fn on_state(&mut self, _state: State) {}

    /// Overall progress in percent, never decreases within a session
    fn on_progress(&mut self, value: u8);

    fn on_finished(&mut self, _outcome: &Result<(), Error<E>>) {}
}

impl<E> Observer<E> for () {
    fn on_progress(&mut self, _value: u8) {}
}

impl<E, O: Observer<E> + ?Sized> Observer<E> for &mut O {
    fn on_start(&mut self) {
        (**self).on_start()
    }

    fn on_state(&mut self, state: State) {
        (**self).on_state(state)
    }

    fn on_progress(&mut self, value: u8) {
        (**self).on_progress(value)
    }

    fn on_finished(&mut self, outcome: &Result<(), Error<E>>) {
        (**self).on_finished(outcome)
    }
}

/// Session event for delivery over a channel
#[derive(Clone, PartialEq, Debug)]
pub enum Event<E> {
    Started,
    State(State),
    Progress(u8),
    Finished(Result<(), Error<E>>),
}

// A disconnected receiver only means nobody is listening any more
impl<E: Clone> Observer<E> for Sender<Event<E>> {
    fn on_start(&mut self) {
        let _ = self.send(Event::Started);
    }

    fn on_state(&mut self, state: State) {
        let _ = self.send(Event::State(state));
    }

    fn on_progress(&mut self, value: u8) {
        let _ = self.send(Event::Progress(value));
    }

    fn on_finished(&mut self, outcome: &Result<(), Error<E>>) {
        let _ = self.send(Event::Finished(outcome.clone()));
    }
}
