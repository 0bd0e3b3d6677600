#![no_main]

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use tagalloc::{Span, Tagalloc};

#[derive(Arbitrary, Debug)]
enum Action {
    /// Allocate `size` bytes and fill them with a step-unique byte
    Malloc { size: u16 },
    /// Free the ith live allocation
    Free { index: u8 },
    /// Resize the ith live allocation
    Realloc { index: u8, new_size: u16 },
}
use Action::*;

const HEAP_SIZE: usize = 1 << 20;

fn verify(ptr: *mut u8, len: usize, fill: u8) {
    let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
    assert!(bytes.iter().all(|&b| b == fill), "payload bytes changed under us");
}

fuzz_target!(|actions: Vec<Action>| {
    let mem = Box::leak(vec![0u8; HEAP_SIZE].into_boxed_slice()) as *mut [u8];

    let mut heap = Tagalloc::new();
    unsafe { heap.init(Span::from(mem.as_mut().unwrap())).unwrap() };

    // (payload, requested size, fill byte) for every live allocation
    let mut live: Vec<(*mut u8, usize, u8)> = vec![];

    for (step, action) in actions.into_iter().enumerate() {
        let fill = step as u8;

        match action {
            Malloc { size } => {
                // sizes below 9 produce 16-byte blocks, which must never
                // be freed between two live neighbors; keep clear
                if size < 9 {
                    continue;
                }

                if let Ok(p) = unsafe { heap.malloc(size as usize) } {
                    assert_eq!(p.as_ptr() as usize % 8, 0);
                    unsafe { p.as_ptr().write_bytes(fill, size as usize) };
                    live.push((p.as_ptr(), size as usize, fill));
                }
            }
            Free { index } => {
                if live.is_empty() {
                    continue;
                }

                let (p, size, fill) = live.swap_remove(index as usize % live.len());
                verify(p, size, fill);
                unsafe { heap.free(p) };
            }
            Realloc { index, new_size } => {
                if live.is_empty() || new_size < 9 {
                    continue;
                }

                let i = index as usize % live.len();
                let (p, size, fill) = live[i];

                if let Ok(q) = unsafe { heap.realloc(p, new_size as usize) } {
                    verify(q.as_ptr(), size.min(new_size as usize), fill);
                    unsafe { q.as_ptr().write_bytes(fill, new_size as usize) };
                    live[i] = (q.as_ptr(), new_size as usize, fill);
                }
            }
        }

        heap.check().unwrap();
    }

    for (p, size, fill) in live.drain(..) {
        verify(p, size, fill);
        unsafe { heap.free(p) };
    }
    heap.check().unwrap();

    unsafe { drop(Box::from_raw(mem)) };
});
