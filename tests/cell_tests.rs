//! Read/modify cell integration tests: deferred writes behind readers,
//! ordering, detachment, and blocking modification.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use knhk_concurrent::{ModifyFuture, SharedCell};
use parking_lot::Mutex;

#[test]
fn test_modification_defers_behind_a_slow_reader() {
    // Arrange: a reader parked inside the cell for ~500 ms.
    let cell = Arc::new(SharedCell::new());
    cell.assign("V".to_string()).unwrap();
    let reader_cell = Arc::clone(&cell);
    let reader = thread::spawn(move || {
        reader_cell
            .read(|value| {
                let snapshot = value.clone();
                thread::sleep(Duration::from_millis(500));
                snapshot
            })
            .unwrap()
    });
    thread::sleep(Duration::from_millis(100));

    // Act: enqueue a write mid-read.
    let future = ModifyFuture::new();
    cell.enqueue_modification(
        |value| *value = "V2".to_string(),
        Some(Arc::clone(&future)),
    )
    .unwrap();

    // Assert: still deferred at ~300 ms, applied once the reader leaves.
    thread::sleep(Duration::from_millis(200));
    assert!(!future.is_complete());
    assert_eq!(reader.join().unwrap(), "V");
    assert!(future.wait(Some(Duration::from_secs(5))));
    assert!(future.is_applied());
    assert_eq!(cell.read(|value| value.clone()).unwrap(), "V2");
}

#[test]
fn test_modifications_apply_in_enqueue_order() {
    // Arrange: hold a reader open while several writes queue up.
    let cell = Arc::new(SharedCell::new());
    cell.assign(Vec::<u32>::new()).unwrap();
    let reader_cell = Arc::clone(&cell);
    let reader = thread::spawn(move || {
        reader_cell
            .read(|_| thread::sleep(Duration::from_millis(300)))
            .unwrap();
    });
    thread::sleep(Duration::from_millis(50));

    // Act
    for i in 0..5 {
        cell.enqueue_modification(move |value| value.push(i), None)
            .unwrap();
    }
    reader.join().unwrap();

    // Assert: strict enqueue order.
    assert_eq!(cell.read(|value| value.clone()).unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_release_with_readers_discards_queued_modifications() {
    // Arrange: a reader in flight and a modification queued behind it.
    let cell = Arc::new(SharedCell::new());
    cell.assign(1u32).unwrap();
    let reader_cell = Arc::clone(&cell);
    let reader = thread::spawn(move || {
        reader_cell
            .read(|value| {
                let snapshot = *value;
                thread::sleep(Duration::from_millis(300));
                snapshot
            })
            .unwrap()
    });
    thread::sleep(Duration::from_millis(50));
    let future = ModifyFuture::new();
    cell.enqueue_modification(|value| *value += 1, Some(Arc::clone(&future)))
        .unwrap();

    // Act: detach while the reader still holds the ref.
    cell.release();

    // Assert: the reader finishes against the old value, the queued write is
    // discarded, and the cell is unassigned.
    assert!(future.wait(Some(Duration::from_secs(5))));
    assert!(!future.is_applied());
    assert_eq!(reader.join().unwrap(), 1);
    assert!(!cell.is_assigned());
}

#[test]
fn test_modify_blocking_waits_for_readers() {
    // Arrange
    let cell = Arc::new(SharedCell::new());
    cell.assign(0u32).unwrap();
    let reader_cell = Arc::clone(&cell);
    let reader = thread::spawn(move || {
        reader_cell
            .read(|_| thread::sleep(Duration::from_millis(300)))
            .unwrap();
    });
    thread::sleep(Duration::from_millis(50));

    // Act
    let start = Instant::now();
    let applied = cell.modify_blocking(|value| *value = 9).unwrap();

    // Assert: the write waited for the reader and then ran.
    assert!(applied);
    assert!(start.elapsed() >= Duration::from_millis(200));
    reader.join().unwrap();
    assert_eq!(cell.read(|value| *value).unwrap(), 9);
}

#[test]
fn test_concurrent_readers_overlap() {
    // Arrange: two readers that each sleep; overlapping them proves reads
    // run with the cell lock released.
    let cell = Arc::new(SharedCell::new());
    cell.assign(()).unwrap();
    let entered = Arc::new(Mutex::new(0u32));
    let start = Instant::now();
    let mut readers = Vec::new();
    for _ in 0..2 {
        let cell = Arc::clone(&cell);
        let entered = Arc::clone(&entered);
        readers.push(thread::spawn(move || {
            cell.read(|()| {
                *entered.lock() += 1;
                thread::sleep(Duration::from_millis(200));
            })
            .unwrap();
        }));
    }
    for reader in readers {
        reader.join().unwrap();
    }

    // Assert: serialized reads would need ~400 ms.
    assert!(start.elapsed() < Duration::from_millis(390));
    assert_eq!(*entered.lock(), 2);
}

#[test]
fn test_builder_rebuilds_after_release() {
    let cell = SharedCell::new().with_builder(|| 100u32);
    assert_eq!(cell.read(|value| *value).unwrap(), 100);
    cell.enqueue_modification(|value| *value += 1, None).unwrap();
    assert_eq!(cell.read(|value| *value).unwrap(), 101);
    cell.release();
    // A fresh value comes from the builder, not the released one.
    assert_eq!(cell.read(|value| *value).unwrap(), 100);
}
