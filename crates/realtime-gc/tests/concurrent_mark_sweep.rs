//! Concurrency tests: mutator threads allocating and writing through the
//! barrier while a background collector thread cycles continuously,
//! exercising the stop-the-world safepoint contract and the allocate-black
//! rule under real thread contention rather than single-threaded simulation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use realtime_gc::{CollectorMode, HeapConfig, RealtimeHeap, StorageClass};

fn heap() -> Arc<RealtimeHeap> {
    RealtimeHeap::new(HeapConfig {
        default_heap_bytes: 64 * 1024 * 1024,
        ..HeapConfig::default()
    })
    .unwrap()
}

#[test]
fn mutators_allocate_concurrently_with_a_running_collector() {
    let heap = heap();
    let collector = heap.spawn_collector(CollectorMode::Continuous);

    const THREADS: usize = 4;
    const PER_THREAD: usize = 5_000;
    let barrier = Arc::new(Barrier::new(THREADS));
    let total_allocated = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let heap = Arc::clone(&heap);
            let barrier = Arc::clone(&barrier);
            let total_allocated = Arc::clone(&total_allocated);
            std::thread::spawn(move || {
                heap.register_mutator_thread();
                barrier.wait();
                for _ in 0..PER_THREAD {
                    // Allocate-black: every one of these is immediately
                    // black, so none of them can be mistaken for garbage by
                    // a cycle that starts mid-loop.
                    let ptr = heap.allocate(16, StorageClass::NoPointers).unwrap();
                    std::hint::black_box(ptr);
                    total_allocated.fetch_add(1, Ordering::Relaxed);
                }
                heap.unregister_mutator_thread();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(total_allocated.load(Ordering::Relaxed), THREADS * PER_THREAD);

    heap.shutdown();
    collector.join().unwrap();

    // Nothing here was rooted, so once the collector (or a final explicit
    // cycle) runs to completion, every allocation should be recyclable.
    heap.register_mutator_thread();
    heap.collect_cycle().unwrap();
    heap.verify_invariants().unwrap();
    heap.unregister_mutator_thread();
}

#[test]
fn concurrent_writer_and_background_collector_preserve_a_rooted_chain() {
    let heap = heap();
    heap.register_mutator_thread();

    // A chain of 200 nodes, each holding one pointer-sized field, rooted at
    // a stack slot for the whole test.
    let mut head: usize = 0;
    for _ in 0..200 {
        let node = heap.allocate(std::mem::size_of::<usize>(), StorageClass::Pointers).unwrap();
        let slot = node.cast::<usize>();
        // SAFETY: freshly allocated, not yet visible to anything else.
        unsafe { heap.write_barrier_uninit(slot, head) };
        head = node.as_ptr() as usize;
    }

    let mut head_slot = head;
    let slot_addr = std::ptr::addr_of_mut!(head_slot) as usize;
    heap.register_global_root(slot_addr, std::mem::size_of::<usize>()).unwrap();

    let collector = heap.spawn_collector(CollectorMode::Continuous);
    // Let a handful of concurrent cycles run while the chain stays rooted.
    std::thread::sleep(Duration::from_millis(50));
    heap.shutdown();
    collector.join().unwrap();

    assert!(heap.gc_count() > 0, "background collector should have completed at least one cycle");
    heap.verify_invariants().unwrap();

    heap.unregister_global_root(slot_addr);
    let stats = heap.collect_cycle().unwrap();
    assert_eq!(stats.objects_recycled, 200, "dropping the root should free the whole chain");

    heap.unregister_mutator_thread();
}
