use arraymem::{acquire, acquire_chunked, is_aligned, release, Allocation};

fn log_alloc<T>(what: &str, alloc: &Allocation<T>) {
    println!("{what}: {} elements ({} bytes)", alloc.len(), alloc.byte_len());
    println!(
        "Received this address: {:?} (aligned: {}, mapped: {})",
        alloc.as_ptr(),
        is_aligned(alloc.as_ptr()),
        alloc.mmap_happened()
    );
}

fn main() -> arraymem::Result<()> {
    let mut values = acquire::<f64>(1_000)?;
    log_alloc("acquire::<f64>(1000)", &values);

    unsafe {
        for i in 0..values.len() {
            values.as_mut_ptr().add(i).write(1.0);
        }
        let data = std::slice::from_raw_parts(values.as_ptr(), values.len());
        println!("Sum: {}", data.iter().sum::<f64>());
    }

    let indices = acquire_chunked::<u32>(300)?;
    log_alloc("acquire_chunked::<u32>(300)", &indices);

    let empty = acquire::<f32>(0)?;
    log_alloc("acquire::<f32>(0)", &empty);

    release(values)?;
    release(indices)?;
    release(empty)?;

    Ok(())
}
