use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use bookshelf::clock::{ManualClock, SystemClock};
use bookshelf::config::{StoreConfig, UpdatePolicy};
use bookshelf::error::StoreError;
use bookshelf::model::{Book, BookId};
use bookshelf::VersionedStore;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Insert(BookId, i64),
    Update(BookId, i64),
    Delete(BookId),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..4, 0i64..100).prop_map(|(id, s)| Op::Insert(id, s)),
        (0i64..4, 0i64..100).prop_map(|(id, s)| Op::Update(id, s)),
        (0i64..4).prop_map(Op::Delete),
    ]
}

proptest! {
    #[test]
    fn store_tracks_model_and_keeps_intervals_ordered(
        ops in prop::collection::vec(op(), 1..40),
        preserve in any::<bool>(),
        steps in prop::collection::vec(1u64..5, 40),
    ) {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = StoreConfig {
            update_policy: if preserve { UpdatePolicy::Preserve } else { UpdatePolicy::Refresh },
            ..StoreConfig::default()
        };
        let db = VersionedStore::in_memory(config, clock.clone());

        let mut model: BTreeMap<BookId, Book> = BTreeMap::new();
        let mut timeline = Vec::new();

        for (op, step) in ops.iter().zip(steps.iter()) {
            let now = clock.advance(*step);
            match op {
                Op::Insert(id, stock) => {
                    let book = Book::new(format!("t{}", stock), *stock);
                    let res = db.insert(*id, book.clone());
                    if model.contains_key(id) {
                        prop_assert!(matches!(res, Err(StoreError::DuplicateKey(_))));
                    } else {
                        prop_assert!(res.is_ok());
                        model.insert(*id, book);
                    }
                }
                Op::Update(id, stock) => {
                    let book = Book::new(format!("u{}", stock), *stock);
                    let res = db.update(*id, book.clone());
                    if model.contains_key(id) {
                        prop_assert!(res.is_ok());
                        model.insert(*id, book);
                    } else {
                        prop_assert!(matches!(res, Err(StoreError::NotFound(_))));
                    }
                }
                Op::Delete(id) => {
                    let res = db.delete(*id);
                    if model.remove(id).is_some() {
                        prop_assert!(res.is_ok());
                    } else {
                        prop_assert!(matches!(res, Err(StoreError::NotFound(_))));
                    }
                }
            }
            timeline.push((now, model.clone()));
        }

        // one open row per id, and exactly the model's rows
        let active: Vec<_> = db.read_active(|_| true).unwrap().collect();
        prop_assert_eq!(active.len(), model.len());
        for r in &active {
            prop_assert!(r.valid_time.is_open());
            prop_assert_eq!(Some(&r.fields), model.get(&r.id));
        }

        let violations = db.verify().unwrap();
        prop_assert!(violations.is_empty(), "{:?}", violations);

        // every past state is recoverable
        for (ts, snapshot) in &timeline {
            for id in 0..4 {
                let seen = db.read_as_of(id, *ts).ok().map(|v| v.fields().clone());
                prop_assert_eq!(seen.as_ref(), snapshot.get(&id), "id {} at {}", id, ts);
            }
        }
    }
}

#[test]
fn update_then_history_holds_exactly_the_old_version() {
    let clock = Arc::new(ManualClock::new(10));
    let db = VersionedStore::in_memory(StoreConfig::default(), clock.clone());

    db.insert(1, Book::new("f1", 1)).unwrap();
    clock.set(20);
    db.update(1, Book::new("f2", 2)).unwrap();

    let history = db.history(1).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].fields, Book::new("f1", 1));
    assert_eq!(history[0].valid_time.end(), Some(20));

    let current: Vec<_> = db.read_active(|r| r.id == 1).unwrap().collect();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].fields, Book::new("f2", 2));
    assert!(current[0].valid_time.is_open());
}

#[test]
fn concurrent_updates_never_archive_the_same_state_twice() {
    let config = StoreConfig {
        lock_timeout: Duration::from_secs(2),
        ..StoreConfig::default()
    };
    let db = Arc::new(VersionedStore::in_memory(config, SystemClock));
    db.insert(1, Book::new("v0", 0)).unwrap();
    thread::sleep(Duration::from_millis(2));

    let handles: Vec<_> = (1..=8)
        .map(|i| {
            let db = db.clone();
            thread::spawn(move || db.update(1, Book::new(format!("v{}", i), i)).map(|r| r.fields))
        })
        .collect();

    let mut applied = HashSet::new();
    for h in handles {
        match h.join().unwrap() {
            Ok(fields) => {
                applied.insert(fields.title);
            }
            Err(StoreError::ConcurrentModification { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let history = db.history(1).unwrap();
    assert_eq!(history.len(), applied.len());

    let archived: Vec<_> = history.iter().map(|h| h.fields.title.clone()).collect();
    let distinct: HashSet<_> = archived.iter().cloned().collect();
    assert_eq!(distinct.len(), archived.len(), "a state was archived twice: {:?}", archived);
    assert_eq!(archived[0], "v0");

    // every successful update is either archived or is the live row
    let live = db.get_active(1).unwrap().unwrap().fields.title;
    let mut seen: HashSet<_> = archived.into_iter().skip(1).collect();
    seen.insert(live);
    assert_eq!(seen, applied);

    assert!(db.verify().unwrap().is_empty());
}

#[test]
fn same_tick_updates_are_serialized() {
    let clock = Arc::new(ManualClock::new(2_000));
    let db = Arc::new(VersionedStore::in_memory(StoreConfig::default(), clock));
    db.insert(1, Book::new("v0", 0)).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (1..=2)
        .map(|i| {
            let (db, barrier) = (db.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                db.update(1, Book::new(format!("v{}", i), i))
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    let history = db.history(1).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].fields.title, "v0");
    assert!(history[0].valid_time.end() < history[1].valid_time.end());
    assert!(db.verify().unwrap().is_empty());
}

#[test]
fn different_books_update_in_parallel() {
    let db = Arc::new(VersionedStore::in_memory(StoreConfig::default(), SystemClock));
    for id in 0..16 {
        db.insert(id, Book::new("x", 0)).unwrap();
    }
    thread::sleep(Duration::from_millis(2));

    let handles: Vec<_> = (0..16)
        .map(|id| {
            let db = db.clone();
            thread::spawn(move || db.update(id, Book::new("y", id)))
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    assert_eq!(db.history_all().unwrap().len(), 16);
    assert_eq!(db.read_active(|r| r.fields.title == "y").unwrap().count(), 16);
}
