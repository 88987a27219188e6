//! End-to-end scenarios: bulk allocation and recycling, a large object
//! surviving via a registered root, a linked structure chained through
//! pointer fields, a write-barrier-retained subgraph, out-of-memory followed
//! by recovery, and a fully emptied page rejoining the empty-pages list.

use std::ptr::NonNull;
use std::sync::Arc;

use realtime_gc::{GcError, HeapConfig, RealtimeHeap, StorageClass};

fn small_heap(bytes: usize) -> Arc<RealtimeHeap> {
    let heap = RealtimeHeap::new(HeapConfig {
        default_heap_bytes: bytes,
        ..HeapConfig::default()
    })
    .unwrap();
    heap.register_mutator_thread();
    heap
}

fn alloc_node(heap: &RealtimeHeap) -> NonNull<u8> {
    heap.allocate(std::mem::size_of::<usize>(), StorageClass::Pointers).unwrap()
}

/// Link a freshly allocated `Pointers`-class node's single field to `next`
/// (or 0). The field has never held a previously-visible value, so this
/// goes through the uninit barrier path rather than the ordinary one.
fn set_next(heap: &RealtimeHeap, node: NonNull<u8>, next: usize) {
    let slot = node.cast::<usize>();
    // SAFETY: `node` is a freshly allocated `Pointers`-class object with one
    // pointer-sized field; nothing else observes it yet.
    unsafe { heap.write_barrier_uninit(slot, next) };
}

#[test]
fn bulk_allocation_with_no_root_retention_is_fully_recycled() {
    let heap = small_heap(16 * 1024 * 1024);
    for _ in 0..1_000 {
        heap.allocate(16, StorageClass::NoPointers).unwrap();
    }
    let stats = heap.collect_cycle().unwrap();
    assert_eq!(stats.objects_recycled, 1_000);
    heap.verify_invariants().unwrap();
    heap.unregister_mutator_thread();
}

#[test]
fn big_object_survives_via_registered_global_and_pages_stay_occupied() {
    let heap = small_heap(64 * 1024 * 1024);
    let ptr = heap.big_allocate(4 * 1024 * 1024, StorageClass::NoPointers).unwrap();

    let mut slot: usize = ptr.as_ptr() as usize;
    let slot_addr = std::ptr::addr_of_mut!(slot) as usize;
    heap.register_global_root(slot_addr, std::mem::size_of::<usize>()).unwrap();

    let stats = heap.collect_cycle().unwrap();
    assert_eq!(stats.objects_recycled, 0);

    heap.unregister_global_root(slot_addr);
    heap.unregister_mutator_thread();
}

#[test]
fn linked_chain_survives_while_rooted_and_is_fully_reclaimed_once_dropped() {
    let heap = small_heap(32 * 1024 * 1024);

    let mut head: usize = 0;
    for _ in 0..10_000 {
        let node = alloc_node(&heap);
        set_next(&heap, node, head);
        head = node.as_ptr() as usize;
    }

    let mut head_slot = head;
    let slot_addr = std::ptr::addr_of_mut!(head_slot) as usize;
    heap.register_global_root(slot_addr, std::mem::size_of::<usize>()).unwrap();

    let stats = heap.collect_cycle().unwrap();
    assert_eq!(stats.objects_recycled, 0, "the whole chain should survive via the head root");

    heap.unregister_global_root(slot_addr);
    let stats = heap.collect_cycle().unwrap();
    assert_eq!(stats.objects_recycled, 10_000, "dropping the head root should free the whole chain");

    heap.unregister_mutator_thread();
}

#[test]
fn write_barrier_retains_a_subgraph_overwritten_mid_cycle() {
    let heap = small_heap(16 * 1024 * 1024);

    // Build a two-node chain: `head -> tail -> null`.
    let tail = alloc_node(&heap);
    set_next(&heap, tail, 0);
    let head = alloc_node(&heap);
    set_next(&heap, head, tail.as_ptr() as usize);

    let mut head_slot = head.as_ptr() as usize;
    let slot_addr = std::ptr::addr_of_mut!(head_slot) as usize;
    heap.register_global_root(slot_addr, std::mem::size_of::<usize>()).unwrap();

    // One quiescent cycle so both nodes have been through a flip.
    heap.collect_cycle().unwrap();

    // Simulate a mutator clearing the root slot mid-cycle: the write
    // barrier must retain the chain that was reachable through the old
    // value (`head`, and transitively `tail`) for the remainder of this
    // cycle, even though the slot no longer points at it afterward.
    let root_slot = NonNull::new(slot_addr as *mut usize).unwrap();
    // SAFETY: `slot_addr` is a live, properly aligned `usize`-sized stack
    // slot for the duration of this scope; the barrier only inspects and
    // conditionally retains the value it is about to overwrite.
    unsafe { heap.write_barrier(root_slot, 0) };

    let stats = heap.collect_cycle().unwrap();
    assert_eq!(stats.objects_recycled, 0, "barrier-retained chain must not be swept this cycle");

    heap.unregister_mutator_thread();
}

#[test]
fn out_of_memory_then_free_then_reallocate_succeeds() {
    let heap = small_heap(256 * 1024); // small enough to exhaust quickly
    let payload_size = 1024usize - 16; // rounds up to the 1024-byte group

    let mut allocated_count = 0usize;
    loop {
        match heap.allocate(payload_size, StorageClass::NoPointers) {
            Ok(_ptr) => allocated_count += 1,
            Err(GcError::OutOfMemory { .. }) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(allocated_count > 0, "heap should have accepted at least one allocation");

    // Nothing above was rooted, so a full cycle recycles everything.
    let stats = heap.collect_cycle().unwrap();
    assert_eq!(stats.objects_recycled, allocated_count);

    // A subsequent allocation of the same size must now succeed.
    heap.allocate(payload_size, StorageClass::NoPointers).unwrap();

    heap.unregister_mutator_thread();
}

#[test]
fn fully_emptied_page_rejoins_the_empty_pages_list() {
    let heap = small_heap(4 * 1024 * 1024);
    let page_size = heap.config().page_size();
    let object_size = 256usize; // group index 8
    let objects_per_page = page_size / object_size;
    let empty_before = heap.empty_page_count();

    for _ in 0..objects_per_page {
        heap.allocate(object_size - 16, StorageClass::NoPointers).unwrap();
    }
    assert_eq!(heap.empty_page_count(), empty_before - 1, "carving the page should leave the list");

    let stats = heap.collect_cycle().unwrap();
    assert_eq!(stats.objects_recycled, objects_per_page);
    heap.verify_invariants().unwrap();
    assert_eq!(heap.empty_page_count(), empty_before, "the page should rejoin the empty-pages list");

    heap.unregister_mutator_thread();
}
