//! Portable in-process signal subsystem (section 4.5).
//!
//! These are not OS signals: `kill` sets a pending bit on the target
//! element's [`crate::element::SignalState`] and wakes it if blocked;
//! delivery happens cooperatively, the next time the target thread reaches
//! a safe point (a blocking wait or a cancellation point) and calls
//! [`deliver_pending`].

use std::time::Duration;

use crate::config::MAX_SIGNAL;
use crate::element::{SignalHandler, SmallId, ThreadElement};
use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::Registry;

pub type Signal = u32;
/// Bitmask over signal numbers `0..=MAX_SIGNAL`.
pub type SigSet = u32;

/// How [`sigmask`] should combine `set_in` with the current mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaskHow {
    Get,
    Set,
    Block,
    Unblock,
}

/// Read or update a thread's signal mask. Always returns the mask as it was
/// *before* the update, mirroring `pthread_sigmask`'s `oldset` convention.
pub fn sigmask(element: &ThreadElement, how: SigmaskHow, set_in: Option<SigSet>) -> SigSet {
    let mut sig = element.signal.lock();
    let old = sig.mask;
    if let Some(set) = set_in {
        sig.mask = match how {
            SigmaskHow::Get => sig.mask,
            SigmaskHow::Set => set,
            SigmaskHow::Block => sig.mask | set,
            SigmaskHow::Unblock => sig.mask & !set,
        };
    }
    old
}

/// Install a handler for `sig`. `sig` must be in `0..=MAX_SIGNAL`.
pub fn set_handler(element: &ThreadElement, sig: Signal, handler: SignalHandler) -> RuntimeResult<()> {
    if sig > MAX_SIGNAL {
        return Err(RuntimeError::InvalidArgument("signal number out of range"));
    }
    element.signal.lock().handlers[sig as usize] = handler;
    Ok(())
}

/// Raise `sig` against `target`. A handler of [`SignalHandler::Ignore`]
/// discards it immediately without ever latching a pending bit; otherwise
/// the bit is set and the target is woken if it is blocked.
///
/// `sig == 0` is the existence-probe signal: it only validates that `target`
/// still names a live element and never latches a pending bit or wakes
/// anything, matching `kill(pid, 0)`'s POSIX contract.
pub fn kill(registry: &Registry, target: SmallId, sig: Signal) -> RuntimeResult<()> {
    if sig > MAX_SIGNAL {
        return Err(RuntimeError::InvalidArgument("signal number out of range"));
    }
    let el = registry.get(target).ok_or(RuntimeError::NotFound)?;
    if sig == 0 {
        return Ok(());
    }
    {
        let mut sigstate = el.signal.lock();
        if matches!(sigstate.handlers[sig as usize], SignalHandler::Ignore) {
            return Ok(());
        }
        sigstate.pending |= 1 << sig;
    }
    {
        let mut state = el.state.lock();
        state.signalled += 1;
    }
    el.pipe_cv.notify_all();
    Ok(())
}

/// Run every currently deliverable (pending and unmasked) handler once, in
/// ascending signal-number order. Each bit is cleared from `pending`, added
/// to `mask` for the duration of its own handler call (so a handler can't be
/// reentered by a `kill` of the same signal arriving while it runs), then
/// unmasked again (section 4.5: "masks the signal, calls the handler,
/// unmasks"). `sig_generation` advances by exactly one per call to this
/// function that delivers anything, not once per bit or per `kill` (section
/// 8's "T's sig_generation increased by exactly 1" property, measured across
/// one dispatch pass regardless of how many `kill`s coalesced into it).
/// Returns whether anything was delivered. Called from safe points: blocking
/// waits, cancellation points, and explicitly from
/// [`sigsuspend`]/[`pause`].
pub fn deliver_pending(element: &ThreadElement) -> bool {
    let mut delivered = false;
    loop {
        let next: Option<(u32, SignalHandler, u32)> = {
            let mut sig = element.signal.lock();
            let deliverable = sig.pending & !sig.mask;
            if deliverable == 0 {
                None
            } else {
                let bit = deliverable.trailing_zeros();
                sig.pending &= !(1 << bit);
                let handler = sig.handlers[bit as usize];
                let saved_mask = sig.mask;
                sig.mask |= 1 << bit;
                sig.in_signal_handler += 1;
                Some((bit, handler, saved_mask))
            }
        };
        let Some((sig_num, handler, saved_mask)) = next else {
            break;
        };
        if let SignalHandler::Handler(f) = handler {
            f(sig_num);
        }
        {
            let mut sig = element.signal.lock();
            sig.mask = saved_mask;
            sig.in_signal_handler -= 1;
        }
        delivered = true;
    }
    if delivered {
        element.signal.lock().generation += 1;
    }
    delivered
}

/// Blocks until an unmasked signal is pending, checking cancellation on
/// entry and again on every wake (`pause`/`sigsuspend` are both cancellation
/// points, section 4.7): a `cancel` arriving while parked here notifies the
/// same `pipe_cv` that `kill` does, so the check fires promptly rather than
/// waiting out the full poll slice.
fn wait_for_unmasked_signal(element: &ThreadElement) {
    loop {
        crate::cancel::cancellation_point(element);
        {
            let sig = element.signal.lock();
            if sig.pending & !sig.mask != 0 {
                return;
            }
        }
        let mut state = element.state.lock();
        element
            .pipe_cv
            .wait_for(&mut state, Duration::from_millis(50));
    }
}

/// Temporarily replace the signal mask, block until an unmasked signal is
/// delivered, then restore the previous mask. Returns `true` once a signal
/// was actually delivered (this call never returns `false`; it mirrors
/// POSIX `sigsuspend`'s "always returns after a signal" contract).
pub fn sigsuspend(element: &ThreadElement, temp_mask: SigSet) -> bool {
    let old_mask = {
        let mut sig = element.signal.lock();
        let old = sig.mask;
        sig.mask = temp_mask;
        old
    };
    wait_for_unmasked_signal(element);
    let delivered = deliver_pending(element);
    element.signal.lock().mask = old_mask;
    delivered
}

/// Block until any unmasked signal is delivered, without altering the mask.
pub fn pause(element: &ThreadElement) -> bool {
    wait_for_unmasked_signal(element);
    deliver_pending(element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Cancelable, ThreadKind};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn elem(registry: &Registry) -> Arc<ThreadElement> {
        let id = registry.reserve_id().unwrap();
        let el = Arc::new(ThreadElement::new(
            id,
            ThreadKind::Discovered,
            std::thread::current().id(),
            Cancelable::No,
            0,
            0,
        ));
        registry.insert(id, el.clone());
        el
    }

    #[test]
    fn mask_block_and_unblock_round_trip() {
        let registry = Registry::new(4);
        let el = elem(&registry);
        let old = sigmask(&el, SigmaskHow::Block, Some(0b101));
        assert_eq!(old, 0);
        let current = sigmask(&el, SigmaskHow::Get, None);
        assert_eq!(current, 0b101);
        sigmask(&el, SigmaskHow::Unblock, Some(0b001));
        assert_eq!(sigmask(&el, SigmaskHow::Get, None), 0b100);
    }

    #[test]
    fn ignored_signal_never_latches() {
        let registry = Registry::new(4);
        let el = elem(&registry);
        set_handler(&el, 5, SignalHandler::Ignore).unwrap();
        kill(&registry, el.small_id, 5).unwrap();
        assert_eq!(el.signal.lock().pending, 0);
    }

    #[test]
    fn handler_runs_and_clears_pending_bit() {
        static COUNT: AtomicU32 = AtomicU32::new(0);
        fn handler(_sig: u32) {
            COUNT.fetch_add(1, Ordering::SeqCst);
        }
        let registry = Registry::new(4);
        let el = elem(&registry);
        set_handler(&el, 3, SignalHandler::Handler(handler)).unwrap();
        kill(&registry, el.small_id, 3).unwrap();
        assert!(deliver_pending(&el));
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
        assert_eq!(el.signal.lock().pending, 0);
    }

    #[test]
    fn generation_advances_once_per_dispatch_pass_not_per_kill() {
        let registry = Registry::new(4);
        let el = elem(&registry);
        kill(&registry, el.small_id, 2).unwrap();
        kill(&registry, el.small_id, 3).unwrap();
        assert_eq!(el.signal.lock().generation, 0);
        assert!(deliver_pending(&el));
        assert_eq!(el.signal.lock().generation, 1);
        // A pass with nothing pending leaves the generation untouched.
        assert!(!deliver_pending(&el));
        assert_eq!(el.signal.lock().generation, 1);
    }

    #[test]
    fn kill_out_of_range_signal_is_rejected() {
        let registry = Registry::new(4);
        let el = elem(&registry);
        assert!(kill(&registry, el.small_id, MAX_SIGNAL + 1).is_err());
        assert!(kill(&registry, el.small_id, MAX_SIGNAL).is_ok());
    }

    #[test]
    fn kill_signal_zero_is_a_pure_existence_probe() {
        let registry = Registry::new(4);
        let el = elem(&registry);
        kill(&registry, el.small_id, 0).unwrap();
        assert_eq!(el.signal.lock().pending, 0);
        assert_eq!(el.state.lock().signalled, 0);
    }

    #[test]
    fn kill_signal_zero_on_missing_target_is_not_found() {
        let registry = Registry::new(4);
        assert!(matches!(kill(&registry, 999, 0), Err(RuntimeError::NotFound)));
    }

    #[test]
    fn pause_returns_once_signalled_from_another_thread() {
        let registry = Arc::new(Registry::new(4));
        let el = elem(&registry);
        let el2 = el.clone();
        let registry2 = registry.clone();
        let target = el.small_id;
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            kill(&registry2, target, 1).unwrap();
        });
        let delivered = pause(&el2);
        assert!(delivered);
        handle.join().unwrap();
    }
}
