// Copyright 2025 Quarry Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Lazy tuple streams
//!
//! The pull-based, fallible iterator carrying tuples between operators,
//! with the small combinator set execution needs. Every stream fuses
//! after its first error - downstream operators surface the error to the
//! consumer and pull nothing further. Dropping a stream drops its
//! upstream cursors.
//!
//! [`Replay`] is the single-producer broadcast used by memoization: the
//! child runs once, consumers share the buffered prefix and extend it on
//! demand.

use std::cell::RefCell;
use std::rc::Rc;

use crate::core::{Error, Result, Tuple};

/// One stream element
pub type TupleResult = Result<Tuple>;

/// A lazy, fallible stream of tuples
pub struct TupleStream {
    inner: Box<dyn Iterator<Item = TupleResult>>,
    errored: bool,
}

impl Iterator for TupleStream {
    type Item = TupleResult;

    fn next(&mut self) -> Option<TupleResult> {
        if self.errored {
            return None;
        }
        let item = self.inner.next();
        if matches!(item, Some(Err(_))) {
            self.errored = true;
        }
        item
    }
}

impl TupleStream {
    /// Wrap an iterator
    pub fn new(inner: impl Iterator<Item = TupleResult> + 'static) -> Self {
        TupleStream {
            inner: Box::new(inner),
            errored: false,
        }
    }

    /// The empty stream
    pub fn empty() -> Self {
        TupleStream::new(std::iter::empty())
    }

    /// A single tuple
    pub fn once(tuple: Tuple) -> Self {
        TupleStream::new(std::iter::once(Ok(tuple)))
    }

    /// A single error
    pub fn error(error: Error) -> Self {
        TupleStream::new(std::iter::once(Err(error)))
    }

    /// A stream over ready results
    pub fn from_results(results: Vec<TupleResult>) -> Self {
        TupleStream::new(results.into_iter())
    }

    /// Defer building the stream until the first pull
    pub fn deferred(build: impl FnOnce() -> TupleStream + 'static) -> Self {
        let mut build = Some(build);
        let mut stream: Option<TupleStream> = None;
        TupleStream::new(std::iter::from_fn(move || {
            if stream.is_none() {
                let b = build.take()?;
                stream = Some(b());
            }
            stream.as_mut().and_then(Iterator::next)
        }))
    }

    /// Map each tuple
    pub fn map_ok(self, mut f: impl FnMut(Tuple) -> Tuple + 'static) -> Self {
        TupleStream::new(self.map(move |item| item.map(&mut f)))
    }

    /// Map each tuple fallibly
    pub fn try_map(self, mut f: impl FnMut(Tuple) -> TupleResult + 'static) -> Self {
        TupleStream::new(self.map(move |item| item.and_then(&mut f)))
    }

    /// Keep tuples passing a fallible predicate
    pub fn filter_ok(self, mut keep: impl FnMut(&Tuple) -> Result<bool> + 'static) -> Self {
        TupleStream::new(self.filter_map(move |item| match item {
            Ok(tuple) => match keep(&tuple) {
                Ok(true) => Some(Ok(tuple)),
                Ok(false) => None,
                Err(error) => Some(Err(error)),
            },
            Err(error) => Some(Err(error)),
        }))
    }

    /// Substitute a whole stream per tuple, concatenated in order
    pub fn flat_map_ok(self, mut f: impl FnMut(Tuple) -> TupleStream + 'static) -> Self {
        let mut outer = self;
        let mut current: Option<TupleStream> = None;
        TupleStream::new(std::iter::from_fn(move || loop {
            if let Some(inner) = current.as_mut() {
                match inner.next() {
                    Some(item) => return Some(item),
                    None => current = None,
                }
            }
            match outer.next() {
                Some(Ok(tuple)) => current = Some(f(tuple)),
                Some(Err(error)) => return Some(Err(error)),
                None => return None,
            }
        }))
    }

    /// Concatenate another stream after this one
    pub fn chain_stream(self, other: TupleStream) -> Self {
        TupleStream::new(self.chain(other))
    }

    /// Emit a default tuple iff the stream yields nothing
    pub fn default_if_empty(self, default: Tuple) -> Self {
        let mut inner = self;
        let mut state = DefaultState::Fresh;
        TupleStream::new(std::iter::from_fn(move || match state {
            DefaultState::Fresh => match inner.next() {
                Some(item) => {
                    state = DefaultState::Streaming;
                    Some(item)
                }
                None => {
                    state = DefaultState::Done;
                    Some(Ok(default.clone()))
                }
            },
            DefaultState::Streaming => inner.next(),
            DefaultState::Done => None,
        }))
    }

    /// Materialise, stopping at the first error
    pub fn collect_ok(self) -> Result<Vec<Tuple>> {
        let mut out = Vec::new();
        for item in self {
            out.push(item?);
        }
        Ok(out)
    }
}

enum DefaultState {
    Fresh,
    Streaming,
    Done,
}

// ============================================================================
// Replay
// ============================================================================

struct ReplayState {
    source: TupleStream,
    buffer: Vec<TupleResult>,
    done: bool,
}

/// Single-producer replay: the source runs at most once, every consumer
/// observes the same elements in the same order
#[derive(Clone)]
pub struct Replay {
    state: Rc<RefCell<ReplayState>>,
}

impl Replay {
    /// Wrap a source stream
    pub fn new(source: TupleStream) -> Self {
        Replay {
            state: Rc::new(RefCell::new(ReplayState {
                source,
                buffer: Vec::new(),
                done: false,
            })),
        }
    }

    /// A consumer stream over the shared buffer
    pub fn stream(&self) -> TupleStream {
        let state = self.state.clone();
        let mut position = 0usize;
        TupleStream::new(std::iter::from_fn(move || {
            let mut state = state.borrow_mut();
            if position < state.buffer.len() {
                let item = state.buffer[position].clone();
                position += 1;
                return Some(item);
            }
            if state.done {
                return None;
            }
            match state.source.next() {
                Some(item) => {
                    state.buffer.push(item.clone());
                    position += 1;
                    Some(item)
                }
                None => {
                    state.done = true;
                    None
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn anon(n: f64) -> Tuple {
        Tuple::anon(Value::Number(n))
    }

    fn numbers(ns: &[f64]) -> TupleStream {
        TupleStream::from_results(ns.iter().map(|n| Ok(anon(*n))).collect())
    }

    #[test]
    fn test_streams_fuse_after_an_error() {
        let stream = TupleStream::from_results(vec![
            Ok(anon(1.0)),
            Err(Error::Store("boom".to_string())),
            Ok(anon(2.0)),
        ]);
        let collected: Vec<_> = stream.collect();
        assert_eq!(collected.len(), 2, "nothing after the first error");
        assert!(collected[1].is_err());
    }

    #[test]
    fn test_default_if_empty() {
        let out = numbers(&[])
            .default_if_empty(anon(9.0))
            .collect_ok()
            .expect("collect");
        assert_eq!(out, vec![anon(9.0)]);

        let out = numbers(&[1.0])
            .default_if_empty(anon(9.0))
            .collect_ok()
            .expect("collect");
        assert_eq!(out, vec![anon(1.0)]);
    }

    #[test]
    fn test_flat_map_preserves_nested_loop_order() {
        let out = numbers(&[1.0, 2.0])
            .flat_map_ok(|t| {
                let base = t.row().and_then(Value::as_number).unwrap_or(0.0);
                numbers(&[base * 10.0, base * 10.0 + 1.0])
            })
            .collect_ok()
            .expect("collect");
        assert_eq!(out, vec![anon(10.0), anon(11.0), anon(20.0), anon(21.0)]);
    }

    #[test]
    fn test_deferred_builds_lazily() {
        let built = Rc::new(std::cell::Cell::new(false));
        let flag = built.clone();
        let mut stream = TupleStream::deferred(move || {
            flag.set(true);
            numbers(&[1.0])
        });
        assert!(!built.get(), "not built before the first pull");
        stream.next();
        assert!(built.get());
    }

    #[test]
    fn test_replay_runs_source_once() {
        let pulls = Rc::new(std::cell::Cell::new(0));
        let counter = pulls.clone();
        let mut n = 0.0;
        let source = TupleStream::new(std::iter::from_fn(move || {
            if n < 3.0 {
                n += 1.0;
                counter.set(counter.get() + 1);
                Some(Ok(anon(n)))
            } else {
                None
            }
        }));
        let replay = Replay::new(source);

        let first = replay.stream().collect_ok().expect("collect");
        let second = replay.stream().collect_ok().expect("collect");
        assert_eq!(first, second);
        assert_eq!(pulls.get(), 3, "source pulled exactly once per element");
    }

    #[test]
    fn test_replay_interleaved_consumers() {
        let replay = Replay::new(numbers(&[1.0, 2.0, 3.0]));
        let mut a = replay.stream();
        let mut b = replay.stream();
        assert_eq!(a.next().unwrap().unwrap(), anon(1.0));
        assert_eq!(b.next().unwrap().unwrap(), anon(1.0));
        assert_eq!(b.next().unwrap().unwrap(), anon(2.0));
        assert_eq!(a.next().unwrap().unwrap(), anon(2.0));
    }
}
