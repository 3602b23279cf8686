//! Two-slot read-ahead
//!
//! A background producer runs ahead of the consumer by at most one
//! buffer. Two slot values circulate between the producer, the filled
//! positions, and the consumer's single lease; a dropped lease returns
//! its buffer to the producer for reuse. `next()` holds a borrow of the
//! prefetcher, so a second lease cannot exist while one is alive.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::error::{Error, Result};

struct State<S> {
    slots: [Option<S>; 2],
    recycle: Vec<S>,
    write_idx: usize,
    done: bool,
    stopping: bool,
    error: Option<Error>,
}

struct Shared<S> {
    state: Mutex<State<S>>,
    can_fill: Condvar,
    can_take: Condvar,
}

/// Background producer with two reusable slots and a single lease.
pub struct TwoSlotPrefetcher<S> {
    shared: Arc<Shared<S>>,
    producer: Option<JoinHandle<()>>,
    read_idx: usize,
}

/// Exclusive view of one filled slot; returns the buffer on drop.
pub struct Lease<'a, S> {
    shared: &'a Shared<S>,
    value: Option<S>,
}

impl<S> Deref for Lease<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.value.as_ref().unwrap()
    }
}

impl<S> DerefMut for Lease<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.value.as_mut().unwrap()
    }
}

impl<S> Drop for Lease<'_, S> {
    fn drop(&mut self) {
        if let Some(v) = self.value.take() {
            self.shared.state.lock().unwrap().recycle.push(v);
            self.shared.can_fill.notify_all();
        }
    }
}

impl<S: Send + 'static> TwoSlotPrefetcher<S> {
    /// Start the producer. `fill` loads one window into the given slot
    /// and returns `Ok(false)` at end of stream; `init` builds the two
    /// initial slot values (buffer pre-sizing happens there).
    pub fn new<F, I>(mut fill: F, init: I) -> TwoSlotPrefetcher<S>
    where
        F: FnMut(&mut S) -> Result<bool> + Send + 'static,
        I: Fn() -> S,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                slots: [None, None],
                recycle: vec![init(), init()],
                write_idx: 0,
                done: false,
                stopping: false,
                error: None,
            }),
            can_fill: Condvar::new(),
            can_take: Condvar::new(),
        });

        let producer_shared = Arc::clone(&shared);
        let producer = std::thread::spawn(move || {
            let shared = producer_shared;
            loop {
                let mut slot = {
                    let mut st = shared.state.lock().unwrap();
                    st = shared
                        .can_fill
                        .wait_while(st, |s| {
                            !s.stopping
                                && (s.slots[s.write_idx].is_some() || s.recycle.is_empty())
                        })
                        .unwrap();
                    if st.stopping {
                        finish(&shared, st);
                        return;
                    }
                    st.recycle.pop().unwrap()
                };

                match fill(&mut slot) {
                    Ok(true) => {
                        let mut st = shared.state.lock().unwrap();
                        if st.stopping {
                            finish(&shared, st);
                            return;
                        }
                        let w = st.write_idx;
                        st.slots[w] = Some(slot);
                        st.write_idx ^= 1;
                        drop(st);
                        shared.can_take.notify_all();
                    }
                    Ok(false) => {
                        let mut st = shared.state.lock().unwrap();
                        st.recycle.push(slot);
                        finish(&shared, st);
                        return;
                    }
                    Err(e) => {
                        let mut st = shared.state.lock().unwrap();
                        st.error = Some(e);
                        finish(&shared, st);
                        return;
                    }
                }
            }
        });

        fn finish<S>(shared: &Shared<S>, mut st: MutexGuard<'_, State<S>>) {
            st.done = true;
            drop(st);
            shared.can_take.notify_all();
        }

        TwoSlotPrefetcher {
            shared,
            producer: Some(producer),
            read_idx: 0,
        }
    }

    /// Block until the next slot is filled. `Ok(None)` at end of
    /// stream; a producer error is re-raised here.
    pub fn next(&mut self) -> Result<Option<Lease<'_, S>>> {
        let r = self.read_idx;
        let mut st = self.shared.state.lock().unwrap();
        st = self
            .shared
            .can_take
            .wait_while(st, |s| {
                !s.stopping && s.error.is_none() && s.slots[r].is_none() && !s.done
            })
            .unwrap();

        if let Some(e) = st.error.take() {
            return Err(e);
        }
        if st.stopping || st.slots[r].is_none() {
            return Ok(None);
        }

        let value = st.slots[r].take();
        drop(st);
        self.shared.can_fill.notify_all();
        self.read_idx ^= 1;

        Ok(Some(Lease {
            shared: &*self.shared,
            value,
        }))
    }

}

impl<S> TwoSlotPrefetcher<S> {
    fn request_stop(&mut self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.stopping = true;
        }
        self.shared.can_fill.notify_all();
        self.shared.can_take.notify_all();

        if let Some(h) = self.producer.take() {
            let _ = h.join();
        }
    }
}

impl<S> Drop for TwoSlotPrefetcher<S> {
    fn drop(&mut self) {
        self.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_windows_in_order() {
        let mut n = 0u32;
        let mut pf = TwoSlotPrefetcher::new(
            move |slot: &mut Vec<u32>| {
                if n == 5 {
                    return Ok(false);
                }
                slot.clear();
                slot.push(n);
                n += 1;
                Ok(true)
            },
            Vec::new,
        );

        let mut seen = Vec::new();
        while let Some(lease) = pf.next().unwrap() {
            seen.push(lease[0]);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        // Exhausted: keeps returning None.
        assert!(pf.next().unwrap().is_none());
    }

    #[test]
    fn error_is_reraised_on_next() {
        let mut n = 0;
        let mut pf = TwoSlotPrefetcher::new(
            move |slot: &mut Vec<u8>| {
                if n == 2 {
                    return Err(Error::Protocol("boom".into()));
                }
                slot.clear();
                slot.push(n);
                n += 1;
                Ok(true)
            },
            Vec::new,
        );

        // The error preempts buffered windows, so anywhere between 0
        // and 2 leases may be observed first depending on timing.
        let mut ok = 0;
        let err = loop {
            match pf.next() {
                Ok(Some(_)) => ok += 1,
                Ok(None) => panic!("expected error"),
                Err(e) => break e,
            }
        };
        assert!(ok <= 2);
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn buffers_are_recycled() {
        let mut n = 0;
        let mut pf = TwoSlotPrefetcher::new(
            move |slot: &mut Vec<u8>| {
                if n == 20 {
                    return Ok(false);
                }
                assert!(slot.capacity() >= 64, "slot lost its allocation");
                n += 1;
                Ok(true)
            },
            || Vec::with_capacity(64),
        );

        while pf.next().unwrap().is_some() {}
    }

    #[test]
    fn drop_stops_unbounded_producer() {
        let mut pf = TwoSlotPrefetcher::new(
            |slot: &mut Vec<u8>| {
                slot.clear();
                slot.push(1);
                Ok(true)
            },
            Vec::new,
        );
        let _ = pf.next().unwrap();
        pf.request_stop();
    }
}
