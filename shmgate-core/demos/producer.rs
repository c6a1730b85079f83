//! Publishes buffer descriptors into a shared-memory port.
//!
//! Run the consumer first in another terminal, then this producer:
//!
//! ```sh
//! cargo run --example consumer
//! cargo run --example producer
//! ```

use std::thread;
use std::time::Duration;

use anyhow::Result;
use shmgate_core::{BufferDescriptor, OpenMode, PortRegistry, PushStatus};
use uuid::Uuid;

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

    let port = registry.open_port(7, 16, 1000, OpenMode::Write)?;
    println!("Producer: port {} opened for writing", port.port_id());

    // Pretend this segment holds our payloads; a real publisher would use
    // its payload allocator's segment id here.
    let payload_segment = Uuid::new_v4();

    for i in 0..10u64 {
        let descriptor = BufferDescriptor::new(payload_segment, 0x100 * (i + 1));
        match port.try_push(descriptor)? {
            PushStatus::Enqueued {
                listeners_active: true,
            } => println!("Producer: pushed descriptor {i}"),
            PushStatus::Enqueued {
                listeners_active: false,
            } => println!("Producer: pushed descriptor {i} (no listeners)"),
            PushStatus::BufferFull => println!("Producer: ring full, descriptor {i} dropped"),
        }
        thread::sleep(Duration::from_millis(200));
    }

    println!(
        "Producer: done, {} overflows observed",
        port.overflows_count()
    );
    Ok(())
}
