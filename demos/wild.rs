//! Uncontrolled FIFO throughput exercise: one producer flooding the
//! queue against two competing consumers, timed end to end.
//!
//! ```bash
//! cargo run --release --example wild
//! ```

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use handoff::Queue;

struct Message {
    id: u32,
}

const QUOTA_1: u64 = 0x1FFFFF;
const QUOTA_2: u64 = 0x1AFFFF;
const THROTTLE: usize = 1000;

fn main() {
    let queue = Arc::new(Queue::<Message>::new());
    let run = Arc::new(AtomicBool::new(false));

    let spawn_consumer = |quota: u64| {
        let queue = Arc::clone(&queue);
        let run = Arc::clone(&run);
        thread::spawn(move || {
            while !run.load(Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
            let mut received = 0_u64;
            let mut checksum = 0_u64;
            while received != quota {
                if let Some(message) = queue.pull() {
                    received += 1;
                    checksum = checksum.wrapping_add(message.id as u64);
                }
            }
            (received, checksum)
        })
    };
    let consumer_1 = spawn_consumer(QUOTA_1);
    let consumer_2 = spawn_consumer(QUOTA_2);

    let producer = {
        let queue = Arc::clone(&queue);
        let run = Arc::clone(&run);
        thread::spawn(move || {
            while !run.load(Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
            let mut i = 0_u64;
            while i != QUOTA_1 + QUOTA_2 {
                if queue.len() < THROTTLE {
                    queue.push(Message { id: i as u32 });
                    i += 1;
                } else {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        })
    };

    let started = Instant::now();
    run.store(true, Relaxed);

    producer.join().unwrap();
    let (received_1, checksum_1) = consumer_1.join().unwrap();
    let (received_2, checksum_2) = consumer_2.join().unwrap();
    let elapsed = started.elapsed();

    let received = received_1 + received_2;
    println!(
        "received {} of {} messages (checksum {:#x}) in {:?}",
        received,
        QUOTA_1 + QUOTA_2,
        checksum_1.wrapping_add(checksum_2),
        elapsed
    );
    assert_eq!(received, QUOTA_1 + QUOTA_2);
}
