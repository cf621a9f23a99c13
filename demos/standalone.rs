use std::ptr::NonNull;

use segalloc::Segalloc;

fn print_alloc(what: &str, address: NonNull<u8>, size: usize) {
    println!("{what}: {size} bytes at {address:?}");
}

fn main() {
    let allocator = Segalloc::new();

    let a = allocator.allocate(1).expect("out of heap");
    print_alloc("allocate", a, 1);

    let b = allocator.allocate(1024).expect("out of heap");
    print_alloc("allocate", b, 1024);

    let zeroed = allocator.zero_alloc(256, 4).expect("out of heap");
    print_alloc("zero_alloc", zeroed, 256 * 4);

    unsafe {
        // Write something recognizable, then grow the block and check the
        // payload survived the move.
        for i in 0..1024 {
            *b.as_ptr().add(i) = (i % 256) as u8;
        }

        let b = allocator.resize(Some(b), 4096).expect("out of heap");
        print_alloc("resize", b, 4096);

        for i in 0..1024 {
            assert_eq!(*b.as_ptr().add(i), (i % 256) as u8);
        }

        println!("Releasing everything...");
        allocator.release(Some(a));
        allocator.release(Some(b));
        allocator.release(Some(zeroed));
    }

    allocator.audit().expect("heap invariants should hold");
    println!("Heap audit passed");
}
