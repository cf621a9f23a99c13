use segalloc::Segalloc;

// Not a Miri demo: under Miri the heap segment is borrowed from the global
// allocator, and serving as the global allocator at the same time would
// re-enter the heap lock while reserving it.

#[global_allocator]
static ALLOCATOR: Segalloc = Segalloc::new();

fn main() {
    // Requests from three different size classes, served directly.
    let small = ALLOCATOR.allocate(24).unwrap();
    let medium = ALLOCATOR.allocate(100).unwrap();
    let large = ALLOCATOR.allocate(1000).unwrap();
    println!("24 B at {small:?}, 100 B at {medium:?}, 1000 B at {large:?}");

    unsafe {
        // Shrinking always splits in place: the freed tail becomes a free
        // block of its own right above the survivor.
        let shrunk = ALLOCATOR.resize(Some(large), 80).unwrap();
        assert_eq!(shrunk, large);

        // Growing again consumes that adjacent free tail, so the payload
        // never moves.
        let grown = ALLOCATOR.resize(Some(shrunk), 600).unwrap();
        assert_eq!(grown, shrunk);

        println!("1000 -> 80 -> 600 bytes resized in place at {grown:?}");

        // Released neighbors fuse into single holes; the audit at the end
        // would fail if any two free blocks were left touching.
        ALLOCATOR.release(Some(small));
        ALLOCATOR.release(Some(medium));
        ALLOCATOR.release(Some(grown));
    }

    // Collections use the same heap once the allocator is installed. A
    // buffer far bigger than the initial segment also forces the heap to
    // extend.
    let big = vec![0xA5u8; 1 << 20];
    println!("1 MiB buffer at {:?}", big.as_ptr());

    let text: String = ('a'..='z').collect();
    println!("String at {:?}: {text}", text.as_ptr());

    ALLOCATOR.audit().expect("heap invariants should hold");
    println!("Heap audit passed");
}
