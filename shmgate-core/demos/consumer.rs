//! Consumes buffer descriptors from a shared-memory port.
//!
//! Start this first, then run the producer in another terminal:
//!
//! ```sh
//! cargo run --example consumer
//! cargo run --example producer
//! ```

use std::sync::atomic::AtomicBool;

use anyhow::Result;
use shmgate_core::{OpenMode, PortRegistry};

fn main() -> Result<()> {
    let registry = PortRegistry::new(
        "demo",
        Box::new(|descriptors, domain| {
            eprintln!(
                "port in domain {domain} died with {} descriptors enqueued",
                descriptors.len()
            );
        }),
    )?;

    let port = registry.open_port(7, 16, 1000, OpenMode::ReadShared)?;
    println!("Consumer: port {} opened for reading", port.port_id());

    let (mut listener, index) = port.create_listener()?;
    let closed = AtomicBool::new(false);

    let mut consumed = 0;
    while consumed < 10 {
        port.wait_pop(&listener, &closed, index)?;
        while let Some(descriptor) = port.head(&listener) {
            println!(
                "Consumer: descriptor from segment {} at offset {:#x}",
                descriptor.segment_id(),
                descriptor.buffer_node_offset
            );
            port.pop(&mut listener)?;
            consumed += 1;
        }
    }

    port.unregister_listener(listener);
    println!("Consumer: done");
    Ok(())
}
