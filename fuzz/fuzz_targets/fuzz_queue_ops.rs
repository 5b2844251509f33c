#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::collections::VecDeque;
use std::time::Duration;
use twolockq::{BlockingQueue, InsertError};

/// One queue call, replayed against a `VecDeque` model
#[derive(Debug, Arbitrary)]
enum FuzzOp {
    TryInsert(u32),
    Insert(u32),
    InsertTimeout(u32),
    TryRemove,
    Remove,
    RemoveTimeout,
    Peek,
    Clear,
    FailNextAlloc,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    capacity: u8,
    ops: Vec<FuzzOp>,
}

fuzz_target!(|input: FuzzInput| {
    let capacity = usize::from(input.capacity % 16).max(1);
    let queue = BlockingQueue::new(capacity);
    let mut model = VecDeque::new();
    let no_wait = Duration::ZERO;

    for op in input.ops {
        match op {
            FuzzOp::TryInsert(v) => match queue.try_insert(v) {
                Ok(()) => model.push_back(v),
                Err(InsertError::Full(back)) => {
                    assert_eq!(model.len(), capacity);
                    assert_eq!(back, v);
                }
                Err(InsertError::AllocFailed(back)) => assert_eq!(back, v),
                Err(InsertError::Timeout(_)) => panic!("try_insert never times out"),
            },
            // Blocking calls are only made when they cannot block.
            FuzzOp::Insert(v) if model.len() < capacity => {
                if queue.insert(v).is_ok() {
                    model.push_back(v);
                }
            }
            FuzzOp::InsertTimeout(v) => match queue.insert_timeout(v, no_wait) {
                Ok(()) => model.push_back(v),
                Err(err) => {
                    assert!(err.is_timeout() || err.is_alloc_failed());
                    assert_eq!(err.into_inner(), v);
                }
            },
            FuzzOp::Remove if !model.is_empty() => {
                assert_eq!(Some(queue.remove()), model.pop_front());
            }
            FuzzOp::TryRemove => assert_eq!(queue.try_remove(), model.pop_front()),
            FuzzOp::RemoveTimeout => {
                assert_eq!(queue.remove_timeout(no_wait), model.pop_front());
            }
            FuzzOp::Peek => assert_eq!(queue.peek(), model.front().copied()),
            FuzzOp::Clear => {
                assert_eq!(queue.clear(), model.len());
                model.clear();
            }
            FuzzOp::FailNextAlloc => twolockq::chaos::inject_alloc_failures(1),
            FuzzOp::Insert(_) | FuzzOp::Remove => {}
        }

        assert_eq!(queue.len(), model.len());
        assert!(queue.len() <= capacity);
    }

    twolockq::chaos::clear_alloc_failures();
});
